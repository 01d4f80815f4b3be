//! Trait defaulting by workload type
//!
//! Every supported workload type has built-in scrape defaults. The workload
//! is classified once per reconcile into a closed set of variants; anything
//! outside that set is [`WorkloadKind::Unsupported`] and the trait pointing
//! at it is removed by the controller.

use kube::api::DynamicObject;
use serde_json::Value;

use vigil_common::crd::{MetricsTrait, PortSpec};
use vigil_common::kube_utils::parse_api_version;

use crate::workload::type_meta;

/// WebLogic admin server exporter port
pub const DEFAULT_WEBLOGIC_PORT: i32 = 7001;
/// Coherence metrics port
pub const DEFAULT_COHERENCE_PORT: i32 = 9612;
/// Port for plain containerized workloads
pub const DEFAULT_GENERIC_PORT: i32 = 8080;
/// Default metrics path
pub const DEFAULT_PATH: &str = "/metrics";
/// WebLogic exporter path
pub const DEFAULT_WEBLOGIC_PATH: &str = "/wls-exporter/metrics";

/// Workload variants with their own scrape defaults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// `weblogic.oracle/*` Domain
    WebLogic,
    /// `coherence.oracle.com/*` Coherence
    Coherence,
    /// Helidon, containerized and Deployment workloads
    Generic,
    /// Everything else
    Unsupported,
}

impl WorkloadKind {
    /// Classify by API group and kind; the version is ignored
    pub fn classify(api_version: &str, kind: &str) -> Self {
        let (group, _) = parse_api_version(api_version);
        match (group.as_str(), kind) {
            ("weblogic.oracle", "Domain") => Self::WebLogic,
            ("coherence.oracle.com", "Coherence") => Self::Coherence,
            ("oam.verrazzano.io", "VerrazzanoHelidonWorkload")
            | ("core.oam.dev", "ContainerizedWorkload")
            | ("apps", "Deployment") => Self::Generic,
            _ => Self::Unsupported,
        }
    }

    /// Classify a fetched workload object
    pub fn of(workload: &DynamicObject) -> Self {
        let (api_version, kind) = type_meta(workload);
        Self::classify(&api_version, &kind)
    }

    /// Resolve defaults for a workload of this kind, `None` if unsupported
    pub fn defaults(&self, workload: &DynamicObject, scraper: &str) -> Option<TraitDefaults> {
        let (port, path, secret) = match self {
            Self::WebLogic => (
                DEFAULT_WEBLOGIC_PORT,
                DEFAULT_WEBLOGIC_PATH,
                weblogic_credentials_secret(&workload.data),
            ),
            Self::Coherence => {
                let metrics = CoherenceMetrics::from_workload(&workload.data);
                let (port, secret) = metrics.overrides();
                (port.unwrap_or(DEFAULT_COHERENCE_PORT), DEFAULT_PATH, secret)
            }
            Self::Generic => (DEFAULT_GENERIC_PORT, DEFAULT_PATH, None),
            Self::Unsupported => return None,
        };

        Some(TraitDefaults {
            port,
            path: path.to_string(),
            secret,
            scraper: scraper.to_string(),
        })
    }
}

/// Defaults resolved for one reconcile; never persisted
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraitDefaults {
    /// Scrape port used when neither the trait nor the pod names one
    pub port: i32,
    /// Scrape path used when neither the trait nor the pod names one
    pub path: String,
    /// Credentials secret in the workload namespace
    pub secret: Option<String>,
    /// Scraper identity as `namespace/name`
    pub scraper: String,
}

/// Coherence `spec.coherence.metrics` block
#[derive(Debug, Default, PartialEq, Eq)]
struct CoherenceMetrics {
    enabled: Option<bool>,
    port: Option<i32>,
    ssl_enabled: bool,
    ssl_secret: Option<String>,
}

impl CoherenceMetrics {
    fn from_workload(data: &Value) -> Self {
        let Some(metrics) = data.pointer("/spec/coherence/metrics") else {
            return Self::default();
        };
        Self {
            enabled: metrics.get("enabled").and_then(Value::as_bool),
            port: metrics
                .get("port")
                .and_then(Value::as_i64)
                .and_then(|p| i32::try_from(p).ok()),
            ssl_enabled: metrics
                .pointer("/ssl/enabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            ssl_secret: metrics
                .pointer("/ssl/secrets")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Port and secret overrides. An explicit `enabled: false` keeps the
    /// built-in defaults rather than turning scraping off.
    fn overrides(&self) -> (Option<i32>, Option<String>) {
        if self.enabled == Some(false) {
            return (None, None);
        }
        let secret = if self.ssl_enabled {
            self.ssl_secret.clone()
        } else {
            None
        };
        (self.port, secret)
    }
}

fn weblogic_credentials_secret(data: &Value) -> Option<String> {
    data.pointer("/spec/webLogicCredentialsSecret/name")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Ports to scrape, in annotation index order.
///
/// With no explicit `ports` list the standalone `port`/`path` pair is the only
/// entry (both may be unset). With a list, a standalone `port` is appended as
/// one more entry rather than overriding anything, so older single-port
/// traits keep working as ports are added.
pub fn resolve_ports(metrics_trait: &MetricsTrait, defaults: &TraitDefaults) -> Vec<PortSpec> {
    let spec = &metrics_trait.spec;
    let mut ports = spec.ports.clone();
    if ports.is_empty() {
        ports.push(PortSpec {
            port: spec.port,
            path: spec.path.clone(),
        });
    } else if spec.port.is_some() {
        ports.push(PortSpec {
            port: spec.port,
            path: Some(spec.path.clone().unwrap_or_else(|| defaults.path.clone())),
        });
    }
    ports
}

/// Explicit path, else the default
pub fn effective_path<'a>(port: &'a PortSpec, defaults: &'a TraitDefaults) -> &'a str {
    port.path.as_deref().unwrap_or(&defaults.path)
}

/// Credentials secret: the trait's, else the workload default
pub fn secret_name<'a>(
    metrics_trait: &'a MetricsTrait,
    defaults: &'a TraitDefaults,
) -> Option<&'a str> {
    metrics_trait
        .spec
        .secret
        .as_deref()
        .or(defaults.secret.as_deref())
}
