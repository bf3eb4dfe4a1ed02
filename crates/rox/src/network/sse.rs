//! Push notification client.
//!
//! A long-lived task keeps a GET open against the notification endpoint and
//! parses the `text/event-stream` body. An event on a subscribed channel
//! (configuration updates) triggers an out-of-band fetch. The reader honors
//! server-supplied `retry:` values, replays `Last-Event-ID` on reconnect,
//! and shuts down cooperatively within one reconnect interval.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// A dispatched server-sent event.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub event_name: String,
    pub data: String,
}

pub type PushEventHandler = std::sync::Arc<dyn Fn(&PushEvent) + Send + Sync>;

/// Handle to the running reader; dropping it does not stop the task, use
/// [`NotificationListener::stop`].
pub struct NotificationListener {
    task: Option<JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<()>,
}

impl NotificationListener {
    /// Spawns the reader against `{listen_url}/{api_key}`.
    pub fn start(listen_url: &str, api_key: &str, handler: PushEventHandler) -> NotificationListener {
        let url = format!("{}/{}", listen_url.trim_end_matches('/'), api_key);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_reader(url, handler, shutdown_rx));
        NotificationListener {
            task: Some(task),
            shutdown_tx,
        }
    }

    /// Signals the reader and waits for it to finish. A pending long-poll is
    /// torn down; in-flight bytes are discarded.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

enum StreamEnd {
    /// Server closed the stream or the transport failed; reconnect.
    Disconnected,
    /// The endpoint does not speak SSE; do not reconnect.
    NotEventStream,
    Shutdown,
}

async fn run_reader(url: String, handler: PushEventHandler, mut shutdown_rx: mpsc::Receiver<()>) {
    let client = reqwest::Client::new();
    let mut reconnect_delay = DEFAULT_RECONNECT_DELAY;
    let mut last_event_id: Option<String> = None;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        debug!(url, "connecting to notification stream");
        match read_stream(
            &client,
            &url,
            &handler,
            &mut last_event_id,
            &mut reconnect_delay,
            &mut shutdown_rx,
        )
        .await
        {
            StreamEnd::Disconnected => {}
            StreamEnd::NotEventStream => break,
            StreamEnd::Shutdown => break,
        }
        debug!(delay_ms = reconnect_delay.as_millis(), "reconnecting to notification stream");
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown_rx.recv() => break,
        }
    }
    info!("notification stream reader stopped");
}

async fn read_stream(
    client: &reqwest::Client,
    url: &str,
    handler: &PushEventHandler,
    last_event_id: &mut Option<String>,
    reconnect_delay: &mut Duration,
    shutdown_rx: &mut mpsc::Receiver<()>,
) -> StreamEnd {
    let mut request = client
        .get(url)
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache");
    if let Some(id) = last_event_id.as_deref() {
        request = request.header("Last-Event-ID", id);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "notification stream connect failed");
            return StreamEnd::Disconnected;
        }
    };
    if !response.status().is_success() {
        warn!(status = response.status().as_u16(), "notification stream rejected");
        return StreamEnd::Disconnected;
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !content_type.starts_with("text/event-stream") {
        error!(url, content_type, "notification endpoint does not serve server-sent events");
        return StreamEnd::NotEventStream;
    }

    let mut events = response.bytes_stream().eventsource();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return StreamEnd::Shutdown,
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if !event.id.is_empty() {
                        *last_event_id = Some(event.id.clone());
                    }
                    if let Some(retry) = event.retry {
                        debug!(retry_ms = retry.as_millis(), "server updated the reconnect delay");
                        *reconnect_delay = retry;
                    }
                    debug!(event = %event.event, "notification event");
                    handler(&PushEvent {
                        event_name: event.event,
                        data: event.data,
                    });
                }
                Some(Err(e)) => {
                    warn!(error = %e, "notification stream error");
                    return StreamEnd::Disconnected;
                }
                None => {
                    debug!("notification stream ended");
                    return StreamEnd::Disconnected;
                }
            }
        }
    }
}
