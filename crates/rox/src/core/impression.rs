//! Impression reporting: one record per evaluation, delivered synchronously
//! to the host handler and queued for the analytics shipper.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::model::{Context, ExperimentModel};

/// What a single evaluation reported. `targeting` is true iff an experiment
/// matched; false when the flag fell through to its default.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportingValue {
    pub name: String,
    pub value: String,
    pub targeting: bool,
    pub experiment: Option<ExperimentInfo>,
}

/// Experiment details carried inside the reporting value when targeting hit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentInfo {
    pub id: String,
    pub name: String,
}

impl ExperimentInfo {
    pub(crate) fn from_model(experiment: &ExperimentModel) -> ExperimentInfo {
        ExperimentInfo {
            id: experiment.id.clone(),
            name: experiment.name.clone(),
        }
    }
}

pub type ImpressionHandler = Arc<dyn Fn(&ReportingValue, Option<&Context>) + Send + Sync>;

/// Analytics record shipped for each impression.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub flag: String,
    pub value: String,
    #[serde(rename = "distinctId")]
    pub distinct_id: String,
    #[serde(rename = "experimentId", skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(rename = "experimentVersion", skip_serializing_if = "Option::is_none")]
    pub experiment_version: Option<String>,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    /// Epoch milliseconds.
    pub time: f64,
}

const ANALYTICS_QUEUE_CAPACITY: usize = 1000;

/// Bounded impression queue drained by the shipper worker. On overflow the
/// oldest event is dropped and a warning is logged.
#[derive(Default)]
pub struct AnalyticsQueue {
    events: Mutex<VecDeque<AnalyticsEvent>>,
    notify: Notify,
}

impl AnalyticsQueue {
    pub fn new() -> AnalyticsQueue {
        AnalyticsQueue::default()
    }

    pub fn push(&self, event: AnalyticsEvent) {
        {
            let mut events = self.events.lock().unwrap();
            if events.len() >= ANALYTICS_QUEUE_CAPACITY {
                let dropped = events.pop_front();
                warn!(
                    flag = dropped.as_ref().map(|e| e.flag.as_str()).unwrap_or(""),
                    "analytics queue full, dropping oldest impression"
                );
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn drain(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }

    /// Resolves once new events may be available.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Invokes the host impression handler and feeds the analytics queue.
/// At most one invocation per evaluation; override reads and peeks never
/// reach this type.
#[derive(Default)]
pub struct ImpressionInvoker {
    handler: RwLock<Option<ImpressionHandler>>,
    queue: Arc<AnalyticsQueue>,
    distinct_id: RwLock<Option<String>>,
}

impl ImpressionInvoker {
    pub fn new() -> ImpressionInvoker {
        ImpressionInvoker::default()
    }

    pub fn set_handler(&self, handler: Option<ImpressionHandler>) {
        *self.handler.write().unwrap() = handler;
    }

    /// Analytics events carry the device identity; queueing starts once it
    /// is known (after setup).
    pub fn set_distinct_id(&self, distinct_id: String) {
        *self.distinct_id.write().unwrap() = Some(distinct_id);
    }

    pub fn queue(&self) -> Arc<AnalyticsQueue> {
        Arc::clone(&self.queue)
    }

    pub fn invoke(&self, value: ReportingValue, context: Option<&Context>) {
        // The guard is released before the handler runs; handlers may call
        // back into the engine.
        let handler = self.handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(&value, context);
        }
        let distinct_id = self.distinct_id.read().unwrap().clone();
        let Some(distinct_id) = distinct_id else {
            debug!(flag = %value.name, "no distinct id yet, skipping analytics impression");
            return;
        };
        self.queue.push(AnalyticsEvent {
            flag: value.name,
            value: value.value,
            distinct_id,
            experiment_id: value.experiment.as_ref().map(|e| e.id.clone()),
            experiment_version: None,
            event_type: "IMPRESSION",
            time: Utc::now().timestamp_millis() as f64,
        });
    }
}

/// Ships queued impressions to the analytics endpoint in batches. Runs until
/// the shutdown signal; a final flush is performed by `shutdown`.
pub(crate) async fn run_shipper(
    queue: Arc<AnalyticsQueue>,
    client: reqwest::Client,
    url: String,
    mut shutdown: tokio::sync::mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = queue.wait() => {}
            _ = shutdown.recv() => break,
        }
        ship_batch(&queue, &client, &url).await;
    }
    ship_batch(&queue, &client, &url).await;
}

pub(crate) async fn ship_batch(queue: &AnalyticsQueue, client: &reqwest::Client, url: &str) {
    let events = queue.drain();
    if events.is_empty() {
        return;
    }
    debug!(count = events.len(), "shipping analytics impressions");
    match client.post(url).json(&events).send().await {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            warn!(status = response.status().as_u16(), "analytics endpoint rejected batch");
        }
        Err(e) => warn!(error = %e, "failed to ship analytics impressions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reporting(name: &str, value: &str, targeting: bool) -> ReportingValue {
        ReportingValue {
            name: name.to_string(),
            value: value.to_string(),
            targeting,
            experiment: None,
        }
    }

    #[test]
    fn handler_is_invoked_synchronously() {
        let invoker = ImpressionInvoker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        invoker.set_handler(Some(Arc::new(
            move |value: &ReportingValue, _: Option<&Context>| {
                assert_eq!(value.name, "demo.flag");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )));
        invoker.invoke(reporting("demo.flag", "false", false), None);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_queue_only_with_distinct_id() {
        let invoker = ImpressionInvoker::new();
        invoker.invoke(reporting("a", "1", false), None);
        assert!(invoker.queue().is_empty());

        invoker.set_distinct_id("device-1".to_string());
        invoker.invoke(reporting("a", "1", true), None);
        let events = invoker.queue().drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].flag, "a");
        assert_eq!(events[0].distinct_id, "device-1");
        assert_eq!(events[0].event_type, "IMPRESSION");
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let queue = AnalyticsQueue::new();
        for i in 0..(ANALYTICS_QUEUE_CAPACITY + 5) {
            queue.push(AnalyticsEvent {
                flag: format!("flag-{i}"),
                value: "v".to_string(),
                distinct_id: "d".to_string(),
                experiment_id: None,
                experiment_version: None,
                event_type: "IMPRESSION",
                time: 0.0,
            });
        }
        let events = queue.drain();
        assert_eq!(events.len(), ANALYTICS_QUEUE_CAPACITY);
        assert_eq!(events[0].flag, "flag-5");
    }

    #[test]
    fn analytics_event_wire_shape() {
        let event = AnalyticsEvent {
            flag: "f".to_string(),
            value: "v".to_string(),
            distinct_id: "d".to_string(),
            experiment_id: Some("e".to_string()),
            experiment_version: None,
            event_type: "IMPRESSION",
            time: 123.0,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["distinctId"], "d");
        assert_eq!(json["experimentId"], "e");
        assert_eq!(json["type"], "IMPRESSION");
        assert!(json.get("experimentVersion").is_none());
    }
}
