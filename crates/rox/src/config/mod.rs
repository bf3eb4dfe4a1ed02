//! Configuration lifecycle: the signed envelope, its parser, and the fetcher
//! that resolves the current configuration across sources.

pub mod fetcher;
pub mod security;

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use md5::{Digest, Md5};

use crate::model::entities::ExperimentEntry;
use crate::model::{ExperimentModel, TargetGroupModel};
use security::SignatureVerifier;

/// Where the applied configuration came from, or that the attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    AppliedFromEmbedded,
    AppliedFromLocalStorage,
    AppliedFromNetwork,
    ErrorFetchedFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetcherError {
    #[default]
    NoError,
    CorruptedJson,
    EmptyJson,
    SignatureVerification,
    Network,
    MismatchAppKey,
    Unknown,
}

/// Delivered to the configuration-fetched handler after every completed
/// attempt.
#[derive(Debug, Clone)]
pub struct ConfigurationFetchedArgs {
    pub fetcher_status: FetchStatus,
    pub creation_date: Option<String>,
    pub has_changes: bool,
    pub error_details: FetcherError,
}

impl ConfigurationFetchedArgs {
    pub(crate) fn error(error: FetcherError) -> ConfigurationFetchedArgs {
        ConfigurationFetchedArgs {
            fetcher_status: FetchStatus::ErrorFetchedFailed,
            creation_date: None,
            has_changes: false,
            error_details: error,
        }
    }
}

pub type ConfigurationFetchedHandler = Arc<dyn Fn(&ConfigurationFetchedArgs) + Send + Sync>;

/// One verified configuration generation.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub target_groups: Vec<TargetGroupModel>,
    pub experiments: Vec<ExperimentModel>,
    pub signed_date: Option<DateTime<FixedOffset>>,
}

#[derive(Debug)]
pub(crate) struct ParsedConfiguration {
    pub configuration: Configuration,
    /// MD5 over the signed data bytes, for change detection.
    pub content_hash: String,
    pub signed_date_raw: Option<String>,
}

/// Checks skipped in roxy mode; the signature check alone is skipped when
/// verification is disabled by option.
pub(crate) struct ParseChecks<'a> {
    pub verifier: Option<&'a SignatureVerifier>,
    pub api_key: Option<&'a str>,
}

impl ParseChecks<'_> {
    pub(crate) fn none() -> ParseChecks<'static> {
        ParseChecks {
            verifier: None,
            api_key: None,
        }
    }
}

/// Parses and verifies the signed envelope `{data, signature_v0, signed_date}`.
///
/// `data` arrives as a JSON string (the signature covers its exact bytes) or
/// as an inline object, which is re-serialized compactly before verification.
pub(crate) fn parse_configuration(
    payload: &str,
    checks: &ParseChecks<'_>,
) -> Result<ParsedConfiguration, FetcherError> {
    if payload.trim().is_empty() {
        return Err(FetcherError::EmptyJson);
    }
    let envelope: serde_json::Value =
        serde_json::from_str(payload).map_err(|_| FetcherError::CorruptedJson)?;
    let data = envelope.get("data").ok_or(FetcherError::CorruptedJson)?;
    let (data_bytes, document) = match data {
        serde_json::Value::String(raw) => {
            let document: serde_json::Value =
                serde_json::from_str(raw).map_err(|_| FetcherError::CorruptedJson)?;
            (raw.clone(), document)
        }
        serde_json::Value::Object(_) => {
            let raw = serde_json::to_string(data).map_err(|_| FetcherError::CorruptedJson)?;
            (raw, data.clone())
        }
        _ => return Err(FetcherError::CorruptedJson),
    };

    if let Some(verifier) = checks.verifier {
        let signature = envelope
            .get("signature_v0")
            .and_then(|v| v.as_str())
            .ok_or(FetcherError::SignatureVerification)?;
        if !verifier.verify(data_bytes.as_bytes(), signature) {
            return Err(FetcherError::SignatureVerification);
        }
    }

    if let Some(api_key) = checks.api_key {
        let application = document
            .get("application")
            .and_then(|v| v.as_str())
            .ok_or(FetcherError::MismatchAppKey)?;
        if !security::api_key_matches(api_key, application) {
            return Err(FetcherError::MismatchAppKey);
        }
    }

    let target_groups = match document.get("targetGroups") {
        Some(groups) => serde_json::from_value::<Vec<TargetGroupModel>>(groups.clone())
            .map_err(|_| FetcherError::CorruptedJson)?,
        None => Vec::new(),
    };
    let experiments = match document.get("experiments") {
        Some(experiments) => serde_json::from_value::<Vec<ExperimentEntry>>(experiments.clone())
            .map_err(|_| FetcherError::CorruptedJson)?
            .into_iter()
            .map(ExperimentModel::from)
            .collect(),
        None => Vec::new(),
    };

    let signed_date_raw = envelope
        .get("signed_date")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    let signed_date = signed_date_raw
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok());

    Ok(ParsedConfiguration {
        configuration: Configuration {
            target_groups,
            experiments,
            signed_date,
        },
        content_hash: content_hash(data_bytes.as_bytes()),
        signed_date_raw,
    })
}

fn content_hash(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
