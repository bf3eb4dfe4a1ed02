//! Targeting entities parsed out of the configuration document.

use serde::Deserialize;

/// A named boolean expression reusable by reference from other expressions
/// through the `isInTargetGroup` operator.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetGroupModel {
    #[serde(rename = "_id")]
    pub id: String,
    pub condition: String,
}

/// A rule expression bound to one or more flags. Its condition evaluates to
/// the chosen variant string, or to undefined to fall through to the flag
/// default.
#[derive(Debug, Clone)]
pub struct ExperimentModel {
    pub id: String,
    pub name: String,
    pub archived: bool,
    pub condition: String,
    pub stickiness_property: Option<String>,
    pub labels: Vec<String>,
    pub flags: Vec<String>,
}

impl ExperimentModel {
    pub fn targets_flag(&self, flag_name: &str) -> bool {
        self.flags.iter().any(|name| name == flag_name)
    }
}

// Wire shape of an experiment entry. The condition lives under
// `deploymentConfiguration`, flags under `featureFlags[].name`.
#[derive(Debug, Deserialize)]
pub(crate) struct ExperimentEntry {
    #[serde(rename = "_id")]
    id: String,
    name: String,
    #[serde(default)]
    archived: bool,
    #[serde(rename = "deploymentConfiguration")]
    deployment: DeploymentConfiguration,
    #[serde(rename = "featureFlags", default)]
    feature_flags: Vec<FeatureFlagRef>,
    #[serde(rename = "stickinessProperty", default)]
    stickiness_property: Option<String>,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DeploymentConfiguration {
    condition: String,
}

#[derive(Debug, Deserialize)]
struct FeatureFlagRef {
    name: String,
}

impl From<ExperimentEntry> for ExperimentModel {
    fn from(entry: ExperimentEntry) -> Self {
        ExperimentModel {
            id: entry.id,
            name: entry.name,
            archived: entry.archived,
            condition: entry.deployment.condition,
            stickiness_property: entry.stickiness_property,
            labels: entry.labels,
            flags: entry.feature_flags.into_iter().map(|f| f.name).collect(),
        }
    }
}
