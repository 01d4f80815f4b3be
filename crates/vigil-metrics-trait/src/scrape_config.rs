//! Shared Prometheus scrape configuration document
//!
//! The legacy scraper reads one YAML document from a ConfigMap. Entries from
//! many traits live side by side in `scrape_configs`, keyed by `job_name`.
//! A trait only ever replaces or removes the entries carrying its own job
//! names; everything else is copied through untouched.

use k8s_openapi::api::apps::v1::Deployment;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use vigil_common::Error;

use crate::relabel::{relabel_rules, AnnotationScheme, RelabelParams, RelabelRule};

/// ConfigMap data key holding the document
pub const CONFIG_KEY: &str = "prometheus.yml";

/// Volume of the scraper deployment that mounts the document's ConfigMap
pub const CONFIG_VOLUME_NAME: &str = "config-volume";

/// Directory where the scraper mounts the Istio client certificates
const ISTIO_CERTS_DIR: &str = "/etc/istio-certs";

// =============================================================================
// Document model
// =============================================================================

/// Parsed scrape configuration document
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ScrapeConfigDocument {
    /// Top-level keys other than `scrape_configs` (global, rule_files, ...)
    #[serde(flatten)]
    pub rest: Mapping,

    /// Scrape jobs from every tenant
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeJob>,
}

/// One entry of `scrape_configs`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScrapeJob {
    /// Merge key
    pub job_name: String,

    /// Everything else in the entry, kept verbatim
    #[serde(flatten)]
    pub fields: Mapping,
}

impl ScrapeConfigDocument {
    /// Parse the stored text; blank text is an empty document
    pub fn parse(text: &str) -> Result<Self, Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| {
            Error::serialization_for(
                "ScrapeConfigDocument",
                format!("failed to parse scrape config document: {e}"),
            )
        })
    }

    /// Render back to YAML
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| {
            Error::serialization_for(
                "ScrapeConfigDocument",
                format!("failed to render scrape config document: {e}"),
            )
        })
    }

    /// True if an entry with this job name exists
    pub fn contains_job(&self, job_name: &str) -> bool {
        self.scrape_configs.iter().any(|j| j.job_name == job_name)
    }

    /// Rebuild the job array for one job name.
    ///
    /// Entries with other names are copied in order. Entries with this name
    /// are dropped, and the synthesized entry (if any) goes on the tail. A
    /// `None` entry therefore removes the job.
    pub fn merge_job(&self, job_name: &str, synthesized: Option<ScrapeJob>) -> Self {
        let mut scrape_configs: Vec<ScrapeJob> = self
            .scrape_configs
            .iter()
            .filter(|j| j.job_name != job_name)
            .cloned()
            .collect();
        scrape_configs.extend(synthesized);
        Self {
            rest: self.rest.clone(),
            scrape_configs,
        }
    }

    /// Compare content without regard to job order.
    ///
    /// Merging moves a rewritten job to the tail; that alone is not worth a
    /// write, since the scraper reloads on every change to the document.
    pub fn same_content(&self, other: &Self) -> bool {
        if self.rest != other.rest || self.scrape_configs.len() != other.scrape_configs.len() {
            return false;
        }
        let mut mine: Vec<&ScrapeJob> = self.scrape_configs.iter().collect();
        let mut theirs: Vec<&ScrapeJob> = other.scrape_configs.iter().collect();
        mine.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        theirs.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        mine == theirs
    }
}

/// Name of the ConfigMap mounted as the scraper's config volume
pub fn config_map_name(scraper: &Deployment) -> Option<String> {
    scraper
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .volumes
        .as_ref()?
        .iter()
        .find(|v| v.name == CONFIG_VOLUME_NAME)?
        .config_map
        .as_ref()
        .map(|cm| cm.name.clone())
}

// =============================================================================
// Job synthesis
// =============================================================================

/// Job layout by workload type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobTemplate {
    /// Targets selected by the controller-managed annotations
    Standard,
    /// Targets selected by the WebLogic operator's `prometheus.io` annotations
    WebLogic,
}

/// Basic auth values read from the credentials secret
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BasicAuthCredentials {
    /// `username` key, if present
    pub username: Option<String>,
    /// `password` key, if present
    pub password: Option<String>,
}

/// Everything a scrape job depends on
#[derive(Clone, Debug)]
pub struct JobParams<'a> {
    /// Merge key
    pub job_name: &'a str,
    /// Application identity label value
    pub app: &'a str,
    /// Component identity label value
    pub component: &'a str,
    /// Namespace to discover pods in
    pub namespace: &'a str,
    /// Port index the job scrapes
    pub port_index: usize,
    /// Cluster name stamped on series
    pub cluster_name: &'a str,
    /// Scrape over Istio mTLS
    pub https: bool,
    /// Layout
    pub template: JobTemplate,
    /// Basic auth, if a credentials secret was found
    pub credentials: Option<&'a BasicAuthCredentials>,
}

#[derive(Serialize)]
struct JobBody {
    scheme: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls_config: Option<TlsBlock>,
    kubernetes_sd_configs: Vec<SdConfig>,
    relabel_configs: Vec<RelabelEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_auth: Option<BasicAuthBlock>,
}

#[derive(Serialize)]
struct TlsBlock {
    ca_file: String,
    cert_file: String,
    key_file: String,
    insecure_skip_verify: bool,
}

#[derive(Serialize)]
struct SdConfig {
    role: &'static str,
    namespaces: SdNamespaces,
}

#[derive(Serialize)]
struct SdNamespaces {
    names: Vec<String>,
}

#[derive(Serialize)]
struct RelabelEntry {
    action: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    source_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    regex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    replacement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_label: Option<String>,
}

impl From<RelabelRule> for RelabelEntry {
    fn from(rule: RelabelRule) -> Self {
        Self {
            action: rule.action,
            source_labels: rule.source_labels,
            regex: rule.regex,
            replacement: rule.replacement,
            target_label: rule.target_label,
        }
    }
}

#[derive(Serialize)]
struct BasicAuthBlock {
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
}

/// Istio client certificate TLS settings: (ca, cert, key)
pub fn istio_cert_files() -> (String, String, String) {
    (
        format!("{ISTIO_CERTS_DIR}/root-cert.pem"),
        format!("{ISTIO_CERTS_DIR}/cert-chain.pem"),
        format!("{ISTIO_CERTS_DIR}/key.pem"),
    )
}

/// Build the scrape job for one port of a trait
pub fn synthesize_job(params: &JobParams<'_>) -> Result<ScrapeJob, Error> {
    let scheme = match params.template {
        JobTemplate::Standard => AnnotationScheme::Managed {
            port_index: params.port_index,
        },
        JobTemplate::WebLogic => AnnotationScheme::Prometheus,
    };
    let rules = relabel_rules(&RelabelParams {
        app: params.app,
        component: params.component,
        cluster_name: params.cluster_name,
        scheme,
        path_from_annotation: true,
    });

    let tls_config = params.https.then(|| {
        let (ca_file, cert_file, key_file) = istio_cert_files();
        TlsBlock {
            ca_file,
            cert_file,
            key_file,
            insecure_skip_verify: true,
        }
    });

    let body = JobBody {
        scheme: if params.https { "https" } else { "http" },
        tls_config,
        kubernetes_sd_configs: vec![SdConfig {
            role: "pod",
            namespaces: SdNamespaces {
                names: vec![params.namespace.to_string()],
            },
        }],
        relabel_configs: rules.into_iter().map(RelabelEntry::from).collect(),
        basic_auth: params.credentials.map(|c| BasicAuthBlock {
            username: c.username.clone(),
            password: c.password.clone(),
        }),
    };

    match serde_yaml::to_value(body) {
        Ok(Value::Mapping(fields)) => Ok(ScrapeJob {
            job_name: params.job_name.to_string(),
            fields,
        }),
        Ok(_) => Err(Error::internal_with_context(
            "scrape-config",
            "scrape job did not render to a mapping",
        )),
        Err(e) => Err(Error::serialization_for(
            "ScrapeJob",
            format!("failed to render scrape job: {e}"),
        )),
    }
}
