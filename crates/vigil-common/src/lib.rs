//! Common types for the vigil operator: CRDs, errors, and Kubernetes helpers

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::{Error, ReconcileError};

// =============================================================================
// Labels and annotations
// =============================================================================

/// OAM application name label
pub const LABEL_APP_NAME: &str = "app.oam.dev/name";
/// OAM component name label
pub const LABEL_COMPONENT_NAME: &str = "app.oam.dev/component";

/// Prefix shared by every scrape annotation the controller writes
pub const METRICS_ANNOTATION_PREFIX: &str = "verrazzano.io/metrics";
/// Scrape enabled flag annotation (suffixed with the port index for index > 0)
pub const METRICS_ENABLED_ANNOTATION: &str = "verrazzano.io/metricsEnabled";
/// Scrape port annotation
pub const METRICS_PORT_ANNOTATION: &str = "verrazzano.io/metricsPort";
/// Scrape path annotation
pub const METRICS_PATH_ANNOTATION: &str = "verrazzano.io/metricsPath";
/// Workload-authored scrape port hint, read but never written
pub const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";
/// Workload-authored scrape path hint, read but never written
pub const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";

/// Namespace label enabling Istio sidecar injection
pub const LABEL_ISTIO_INJECTION: &str = "istio-injection";
/// Namespace label selecting an Istio revision
pub const LABEL_ISTIO_REVISION: &str = "istio.io/rev";

// =============================================================================
// Platform identities
// =============================================================================

/// Namespace holding platform components
pub const VERRAZZANO_SYSTEM_NAMESPACE: &str = "verrazzano-system";
/// Built-in Prometheus instance that reads the shared scrape config document
pub const LEGACY_SCRAPER: &str = "verrazzano-system/vmi-system-prometheus-0";
/// Secret that exists only on managed clusters and names the cluster
pub const CLUSTER_REGISTRATION_SECRET: &str = "verrazzano-cluster-registration";
/// Key within [`CLUSTER_REGISTRATION_SECRET`] holding the cluster name
pub const CLUSTER_NAME_KEY: &str = "managed-cluster-name";
/// Cluster name stamped into scrape configs on the local cluster
pub const LOCAL_CLUSTER_NAME: &str = "local";

/// Namespaces whose traits are never reconciled
pub const DEFAULT_RESERVED_NAMESPACES: &[&str] = &["kube-system"];

// =============================================================================
// Requeue intervals
// =============================================================================

/// Requeue delay after a failed reconcile
pub const REQUEUE_ERROR_SECS: u64 = 5;
/// Lower bound of the jittered requeue after a clean reconcile
pub const REQUEUE_SUCCESS_MIN_SECS: u64 = 45;
/// Upper bound of the jittered requeue after a clean reconcile
pub const REQUEUE_SUCCESS_MAX_SECS: u64 = 90;
