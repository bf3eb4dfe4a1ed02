//! Resolves the current configuration across sources.
//!
//! Source precedence at setup: a roxy proxy when configured (exclusively, no
//! checks), otherwise the network endpoint, falling back to the last
//! persisted payload and then to the embedded one. Once a configuration has
//! been applied, later fetches go to the network only; a failure keeps the
//! last good configuration serving.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use tracing::{debug, warn};

use crate::config::security::SignatureVerifier;
use crate::config::{
    parse_configuration, ConfigurationFetchedArgs, FetchStatus, FetcherError, ParseChecks,
    ParsedConfiguration,
};
use crate::storage::StorageEntry;

pub(crate) struct FetchOutcome {
    pub args: ConfigurationFetchedArgs,
    /// `Some` when a new generation should be applied; `None` on failure and
    /// on replayed or unchanged payloads that carry nothing new.
    pub configuration: Option<crate::config::Configuration>,
}

pub(crate) struct FetcherConfig {
    pub api_key: String,
    pub configuration_url: String,
    pub roxy_url: Option<String>,
    pub distinct_id: String,
    pub app_version: String,
    pub embedded: Option<String>,
    pub verify_signature: bool,
    pub network_timeout: Duration,
}

#[derive(Default)]
struct FetcherState {
    applied_hash: Option<String>,
    applied_signed_date: Option<DateTime<FixedOffset>>,
    has_applied: bool,
}

pub(crate) struct ConfigurationFetcher {
    client: reqwest::Client,
    config: FetcherConfig,
    entry: Arc<dyn StorageEntry>,
    verifier: Option<SignatureVerifier>,
    state: Mutex<FetcherState>,
}

impl ConfigurationFetcher {
    pub fn new(config: FetcherConfig, entry: Arc<dyn StorageEntry>) -> ConfigurationFetcher {
        let verifier = if config.verify_signature {
            Some(SignatureVerifier::new())
        } else {
            warn!("configuration signature verification is disabled; development use only");
            None
        };
        let client = reqwest::Client::builder()
            .timeout(config.network_timeout)
            .build()
            .unwrap_or_default();
        ConfigurationFetcher {
            client,
            config,
            entry,
            verifier,
            state: Mutex::new(FetcherState::default()),
        }
    }

    pub async fn fetch(&self) -> FetchOutcome {
        if let Some(roxy_url) = &self.config.roxy_url {
            return self.fetch_from_roxy(roxy_url).await;
        }

        let network_error = match self.download(&self.configuration_endpoint()).await {
            Ok(payload) => match self.accept(&payload, FetchStatus::AppliedFromNetwork) {
                Ok(outcome) => {
                    if outcome.configuration.is_some() {
                        self.entry.write(&payload);
                    }
                    return outcome;
                }
                Err(error) => error,
            },
            Err(error) => error,
        };
        debug!(?network_error, "network configuration source failed");

        if !self.state.lock().unwrap().has_applied {
            if let Some(payload) = self.entry.read() {
                if let Ok(outcome) = self.accept(&payload, FetchStatus::AppliedFromLocalStorage) {
                    return outcome;
                }
            }
            if let Some(payload) = self.config.embedded.clone() {
                if let Ok(outcome) = self.accept(&payload, FetchStatus::AppliedFromEmbedded) {
                    return outcome;
                }
            }
        }

        FetchOutcome {
            args: ConfigurationFetchedArgs::error(network_error),
            configuration: None,
        }
    }

    // The local proxy serves unsigned development configurations; signature
    // and api-key checks do not apply and there are no fallback sources.
    async fn fetch_from_roxy(&self, roxy_url: &str) -> FetchOutcome {
        let url = format!(
            "{}/{}",
            roxy_url.trim_end_matches('/'),
            self.config.api_key
        );
        match self.download(&url).await {
            Ok(payload) => self
                .accept_with(&payload, FetchStatus::AppliedFromNetwork, &ParseChecks::none())
                .unwrap_or_else(|error| FetchOutcome {
                    args: ConfigurationFetchedArgs::error(error),
                    configuration: None,
                }),
            Err(error) => FetchOutcome {
                args: ConfigurationFetchedArgs::error(error),
                configuration: None,
            },
        }
    }

    fn configuration_endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.config.configuration_url.trim_end_matches('/'),
            self.config.api_key
        )
    }

    async fn download(&self, url: &str) -> Result<String, FetcherError> {
        let response = self
            .client
            .get(url)
            .query(&[
                ("distinct_id", self.config.distinct_id.as_str()),
                ("app_version", self.config.app_version.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                debug!(url, error = %e, "configuration request failed");
                FetcherError::Network
            })?;
        if !response.status().is_success() {
            debug!(url, status = response.status().as_u16(), "configuration request rejected");
            return Err(FetcherError::Network);
        }
        response.text().await.map_err(|_| FetcherError::Network)
    }

    fn accept(&self, payload: &str, status: FetchStatus) -> Result<FetchOutcome, FetcherError> {
        let checks = ParseChecks {
            verifier: self.verifier.as_ref(),
            api_key: Some(&self.config.api_key),
        };
        self.accept_with(payload, status, &checks)
    }

    fn accept_with(
        &self,
        payload: &str,
        status: FetchStatus,
        checks: &ParseChecks<'_>,
    ) -> Result<FetchOutcome, FetcherError> {
        let parsed = parse_configuration(payload, checks)?;
        Ok(self.apply_state(parsed, status))
    }

    fn apply_state(&self, parsed: ParsedConfiguration, status: FetchStatus) -> FetchOutcome {
        let mut state = self.state.lock().unwrap();

        // Replay guard: an older signed_date than the applied one is dropped
        // silently and keeps the current configuration serving.
        if let (Some(new), Some(applied)) = (
            parsed.configuration.signed_date,
            state.applied_signed_date,
        ) {
            if new < applied {
                debug!(%new, %applied, "dropping configuration payload older than the applied one");
                return FetchOutcome {
                    args: ConfigurationFetchedArgs {
                        fetcher_status: status,
                        creation_date: parsed.signed_date_raw,
                        has_changes: false,
                        error_details: FetcherError::NoError,
                    },
                    configuration: None,
                };
            }
        }

        let has_changes = state.applied_hash.as_deref() != Some(parsed.content_hash.as_str());
        state.applied_hash = Some(parsed.content_hash);
        if parsed.configuration.signed_date.is_some() {
            state.applied_signed_date = parsed.configuration.signed_date;
        }
        state.has_applied = true;

        FetchOutcome {
            args: ConfigurationFetchedArgs {
                fetcher_status: status,
                creation_date: parsed.signed_date_raw,
                has_changes,
                error_details: FetcherError::NoError,
            },
            configuration: Some(parsed.configuration),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, Storage};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API_KEY: &str = "0123456789abcdef01234567";

    fn payload(signed_date: &str, condition: &str) -> String {
        let data = serde_json::json!({
            "application": API_KEY,
            "targetGroups": [],
            "experiments": [{
                "_id": "e1",
                "name": "exp",
                "deploymentConfiguration": {"condition": condition},
                "featureFlags": [{"name": "demo.flag"}]
            }]
        });
        serde_json::json!({
            "data": data.to_string(),
            "signature_v0": "sig",
            "signed_date": signed_date
        })
        .to_string()
    }

    fn fetcher(url: &str, entry: Arc<dyn StorageEntry>, embedded: Option<String>) -> ConfigurationFetcher {
        ConfigurationFetcher::new(
            FetcherConfig {
                api_key: API_KEY.to_string(),
                configuration_url: url.to_string(),
                roxy_url: None,
                distinct_id: "device-1".to_string(),
                app_version: "1.0.0".to_string(),
                embedded,
                verify_signature: false,
                network_timeout: Duration::from_secs(5),
            },
            entry,
        )
    }

    fn temp_entry(dir: &tempfile::TempDir) -> Arc<dyn StorageEntry> {
        FileStorage::new(dir.path()).entry(&format!("configuration.{API_KEY}"))
    }

    #[tokio::test]
    async fn network_fetch_applies_and_persists() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/{API_KEY}")))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(payload("2024-03-01T10:00:00Z", "true")),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = temp_entry(&dir);
        let fetcher = fetcher(&server.uri(), Arc::clone(&entry), None);

        let outcome = fetcher.fetch().await;
        assert_eq!(outcome.args.fetcher_status, FetchStatus::AppliedFromNetwork);
        assert!(outcome.args.has_changes);
        assert_eq!(outcome.args.error_details, FetcherError::NoError);
        let configuration = outcome.configuration.unwrap();
        assert_eq!(configuration.experiments.len(), 1);
        assert!(entry.read().is_some());

        // Re-fetching the identical payload reports no changes.
        let outcome = fetcher.fetch().await;
        assert!(!outcome.args.has_changes);
        assert!(outcome.configuration.is_some());
    }

    #[tokio::test]
    async fn falls_back_to_persisted_then_embedded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let entry = temp_entry(&dir);
        entry.write(&payload("2024-03-01T10:00:00Z", "true"));
        let fetcher_with_storage = fetcher(&server.uri(), Arc::clone(&entry), None);
        let outcome = fetcher_with_storage.fetch().await;
        assert_eq!(
            outcome.args.fetcher_status,
            FetchStatus::AppliedFromLocalStorage
        );
        assert!(outcome.configuration.is_some());

        let dir = tempfile::tempdir().unwrap();
        let fetcher_with_embedded = fetcher(
            &server.uri(),
            temp_entry(&dir),
            Some(payload("2024-02-01T10:00:00Z", "true")),
        );
        let outcome = fetcher_with_embedded.fetch().await;
        assert_eq!(
            outcome.args.fetcher_status,
            FetchStatus::AppliedFromEmbedded
        );
        assert!(outcome.configuration.is_some());
    }

    #[tokio::test]
    async fn reports_network_error_when_all_sources_fail() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), temp_entry(&dir), None);
        let outcome = fetcher.fetch().await;
        assert_eq!(outcome.args.fetcher_status, FetchStatus::ErrorFetchedFailed);
        assert_eq!(outcome.args.error_details, FetcherError::Network);
        assert!(outcome.configuration.is_none());
    }

    #[tokio::test]
    async fn older_signed_date_is_silently_dropped() {
        let server = MockServer::start().await;
        let newer = Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(payload("2024-03-01T10:00:00Z", "true")),
            )
            .expect(1);
        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), temp_entry(&dir), None);
        {
            let _guard = server.register_as_scoped(newer).await;
            let outcome = fetcher.fetch().await;
            assert!(outcome.configuration.is_some());
        }

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(payload("2023-01-01T10:00:00Z", "false")),
            )
            .mount(&server)
            .await;
        let outcome = fetcher.fetch().await;
        assert!(outcome.configuration.is_none());
        assert!(!outcome.args.has_changes);
        assert_eq!(outcome.args.error_details, FetcherError::NoError);
    }

    #[tokio::test]
    async fn mismatched_app_key_is_an_error() {
        let data = serde_json::json!({"application": "ffffffffffffffffffffffff"});
        let body = serde_json::json!({
            "data": data.to_string(),
            "signed_date": "2024-03-01T10:00:00Z"
        })
        .to_string();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = fetcher(&server.uri(), temp_entry(&dir), None);
        let outcome = fetcher.fetch().await;
        assert_eq!(outcome.args.fetcher_status, FetchStatus::ErrorFetchedFailed);
        assert_eq!(outcome.args.error_details, FetcherError::MismatchAppKey);
    }

    #[tokio::test]
    async fn roxy_mode_skips_checks_and_fallbacks() {
        let server = MockServer::start().await;
        let data = serde_json::json!({
            "application": "whatever",
            "experiments": [],
            "targetGroups": []
        });
        Mock::given(method("GET"))
            .and(path(format!("/{API_KEY}")))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                serde_json::json!({"data": data.to_string()}).to_string(),
            ))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let config = FetcherConfig {
            api_key: API_KEY.to_string(),
            configuration_url: "http://unused.invalid".to_string(),
            roxy_url: Some(server.uri()),
            distinct_id: "device-1".to_string(),
            app_version: "1.0.0".to_string(),
            embedded: None,
            verify_signature: true,
            network_timeout: Duration::from_secs(5),
        };
        let fetcher = ConfigurationFetcher::new(config, temp_entry(&dir));
        let outcome = fetcher.fetch().await;
        assert_eq!(outcome.args.fetcher_status, FetchStatus::AppliedFromNetwork);
        assert!(outcome.configuration.is_some());
    }
}
