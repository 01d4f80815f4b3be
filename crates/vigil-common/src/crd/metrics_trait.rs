//! MetricsTrait CRD: metrics scraping attached to an application workload
//!
//! A MetricsTrait points at one workload and asks for its pods to be scraped.
//! The controller turns that into pod-template annotations plus either an
//! entry in the shared Prometheus scrape document or a ServiceMonitor, and
//! records every object it touched in `status.resourceRelations`.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::{LABEL_APP_NAME, LABEL_COMPONENT_NAME};

// =============================================================================
// CRD
// =============================================================================

/// Desired metrics scraping for a workload
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "oam.verrazzano.io",
    version = "v1alpha1",
    kind = "MetricsTrait",
    plural = "metricstraits",
    namespaced,
    status = "MetricsTraitStatus",
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadRef.name"}"#,
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.conditions[?(@.type==\"Synced\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTraitSpec {
    /// Workload whose pods are scraped
    pub workload_ref: WorkloadReference,

    /// Scraping is on unless this is explicitly false
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Explicit scrape ports; index 0 maps to the un-suffixed annotations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortSpec>,

    /// Single scrape port (appended to `ports` when both are set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,

    /// Scrape path paired with `port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Name of a secret in the workload namespace holding basic auth credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Scraper identity as `namespace/name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper: Option<String>,
}

/// Reference to the workload a trait applies to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadReference {
    /// API version of the workload (e.g., "apps/v1")
    pub api_version: String,
    /// Kind of the workload (e.g., "Deployment")
    pub kind: String,
    /// Name of the workload in the trait's namespace
    pub name: String,
}

/// One scrape port and its path
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    /// HTTP path of the metrics endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Observed state of a MetricsTrait
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsTraitStatus {
    /// Rolled-up reconcile condition
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Every object this trait currently owns a side effect on
    #[serde(default)]
    pub resource_relations: Vec<QualifiedResourceRelation>,
}

/// Why a trait holds a relation to an object
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    /// Object that carries scrape configuration (ConfigMap, ServiceMonitor)
    Scraper,
    /// Object whose pod template carries scrape annotations
    Source,
    /// Aggregating object that embeds the trait definition
    Owner,
    /// Role written by a newer controller version
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for RelationRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scraper => write!(f, "scraper"),
            Self::Source => write!(f, "source"),
            Self::Owner => write!(f, "owner"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A namespaced object reference plus the role it plays for the trait
#[derive(
    Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub struct QualifiedResourceRelation {
    /// API version of the related object
    pub api_version: String,
    /// Kind of the related object
    pub kind: String,
    /// Namespace of the related object
    pub namespace: String,
    /// Name of the related object
    pub name: String,
    /// Role of the relation
    pub role: RelationRole,
}

impl QualifiedResourceRelation {
    /// Create a relation
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        role: RelationRole,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            role,
        }
    }
}

impl std::fmt::Display for QualifiedResourceRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {}/{} ({})",
            self.api_version, self.kind, self.namespace, self.name, self.role
        )
    }
}

impl MetricsTrait {
    /// Scraping is enabled unless `spec.enabled` is explicitly false
    pub fn is_enabled(&self) -> bool {
        self.spec.enabled.unwrap_or(true)
    }

    /// True once the API server has marked the trait for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Application name label, if set
    pub fn app_name(&self) -> Option<&str> {
        self.labels().get(LABEL_APP_NAME).map(String::as_str)
    }

    /// Component name label, if set
    pub fn component_name(&self) -> Option<&str> {
        self.labels().get(LABEL_COMPONENT_NAME).map(String::as_str)
    }

    /// Relations persisted by the previous reconcile
    pub fn previous_relations(&self) -> &[QualifiedResourceRelation] {
        self.status
            .as_ref()
            .map(|s| s.resource_relations.as_slice())
            .unwrap_or(&[])
    }
}
