//! Side-effecting steps of an active reconcile pass
//!
//! Each step returns the ledger entries for the objects it touched. Steps
//! never abort each other: a failure is recorded and the pass moves on.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use vigil_common::crd::{
    MetricsTrait, PortSpec, QualifiedResourceRelation, RelationRole, ServiceMonitor,
};
use vigil_common::kube_utils::HasApiResource;
use vigil_common::{Error, LABEL_ISTIO_INJECTION, LABEL_ISTIO_REVISION, LEGACY_SCRAPER, LOCAL_CLUSTER_NAME};

use crate::annotations::MutationMode;
use crate::client::KubeClient;
use crate::defaults::{secret_name, TraitDefaults, WorkloadKind};
use crate::ledger::{LedgerEntry, Outcome};
use crate::naming::{job_name, service_monitor_name};
use crate::scrape_config::{
    config_map_name, synthesize_job, BasicAuthCredentials, JobParams, JobTemplate,
    ScrapeConfigDocument, CONFIG_KEY,
};
use crate::service_monitor::{build_service_monitor, is_up_to_date, MonitorParams};
use crate::source::{mutate_source, source_relation};

/// Kind of the OAM object that embeds trait definitions
pub const APP_CONFIG_KIND: &str = "ApplicationConfiguration";

/// Coherence wrapper kind; its pods always scrape in plaintext
const COHERENCE_WRAPPER_KIND: &str = "VerrazzanoCoherenceWorkload";

// =============================================================================
// Scraper mode
// =============================================================================

/// How scrape configuration is delivered for a trait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScraperMode {
    /// The trait names the built-in scraper itself; a separate
    /// ServiceMonitor path owns it and this controller stays out
    Skip,
    /// Entries in the built-in scraper's shared scrape document
    ConfigDocument,
    /// One ServiceMonitor per trait
    ServiceMonitor,
}

impl ScraperMode {
    /// Select the mode from the trait and the operator-configured scraper
    pub fn select(metrics_trait: &MetricsTrait, defaults: &TraitDefaults) -> Self {
        match metrics_trait.spec.scraper.as_deref() {
            Some(LEGACY_SCRAPER) => Self::Skip,
            Some(_) => Self::ServiceMonitor,
            None if defaults.scraper == LEGACY_SCRAPER => Self::ConfigDocument,
            None => Self::ServiceMonitor,
        }
    }
}

// =============================================================================
// Pass inputs
// =============================================================================

/// Everything resolved once at the start of an active pass
pub struct TraitPass<'a> {
    /// Object store
    pub kube: &'a dyn KubeClient,
    /// Trait being reconciled
    pub metrics_trait: &'a MetricsTrait,
    /// Workload variant
    pub kind: WorkloadKind,
    /// Defaults for the workload variant
    pub defaults: &'a TraitDefaults,
    /// Resolved ports in annotation index order
    pub ports: &'a [PortSpec],
    /// Managed cluster name, `None` on the local cluster
    pub cluster: Option<&'a str>,
}

impl TraitPass<'_> {
    fn namespace(&self) -> String {
        self.metrics_trait.namespace().unwrap_or_default()
    }

    fn is_active(&self) -> bool {
        !self.metrics_trait.is_deleting() && self.metrics_trait.is_enabled()
    }

    fn scraper(&self) -> &str {
        self.metrics_trait
            .spec
            .scraper
            .as_deref()
            .unwrap_or(&self.defaults.scraper)
    }

    fn is_coherence_family(&self) -> bool {
        self.kind == WorkloadKind::Coherence
            || self.metrics_trait.spec.workload_ref.kind == COHERENCE_WRAPPER_KIND
    }

    /// Mesh scraping uses Istio client certs unless the workload is Coherence
    async fn uses_https(&self) -> Result<bool, Error> {
        if self.is_coherence_family() {
            return Ok(false);
        }
        let namespace = self.kube.get_namespace(&self.namespace()).await?;
        Ok(namespace.is_some_and(|ns| is_mesh_enabled(ns.labels())))
    }

    /// Basic auth credentials from the resolved secret; a missing secret
    /// means no auth
    async fn credentials(&self) -> Result<Option<BasicAuthCredentials>, Error> {
        let Some(name) = secret_name(self.metrics_trait, self.defaults) else {
            return Ok(None);
        };
        let secret = self.kube.get_secret(&self.namespace(), name).await?;
        if secret.is_none() {
            debug!(secret = %name, "credentials secret not found, scraping without auth");
        }
        Ok(secret.map(|s| BasicAuthCredentials {
            username: secret_value(&s, "username"),
            password: secret_value(&s, "password"),
        }))
    }
}

fn is_mesh_enabled(labels: &BTreeMap<String, String>) -> bool {
    labels
        .get(LABEL_ISTIO_INJECTION)
        .is_some_and(|v| v == "enabled")
        || labels.contains_key(LABEL_ISTIO_REVISION)
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| String::from_utf8(v.0.clone()).ok())
}

/// Entries for a scraper step that failed before it could name its object.
///
/// The previous scraper relations are carried as failed so the reaper does
/// not tear down what this pass could not reproduce.
fn scraper_failure(metrics_trait: &MetricsTrait, error: Error) -> Vec<LedgerEntry> {
    warn!(error = %error, "scraper step failed");
    let error = vigil_common::ReconcileError::from(error);
    let previous: Vec<LedgerEntry> = metrics_trait
        .previous_relations()
        .iter()
        .filter(|r| r.role == RelationRole::Scraper)
        .map(|r| LedgerEntry::failed(Some(r.clone()), error.clone()))
        .collect();
    if previous.is_empty() {
        vec![LedgerEntry::failed(None, error)]
    } else {
        previous
    }
}

// =============================================================================
// Scrape sources
// =============================================================================

/// Write (or strip) scrape annotations on every child that runs pods
pub async fn sync_sources(pass: &TraitPass<'_>, children: Vec<DynamicObject>) -> Vec<LedgerEntry> {
    let mode = MutationMode::for_trait(pass.metrics_trait);
    let mut entries = Vec::new();

    for mut child in children {
        let relation = source_relation(&child);
        let Some(changed) =
            mutate_source(&mut child, mode, pass.metrics_trait, pass.ports, pass.defaults)
        else {
            continue;
        };

        if !changed {
            debug!(source = %relation, "scrape annotations up to date");
            entries.push(LedgerEntry::ok(relation, Outcome::Unchanged));
            continue;
        }

        match pass.kube.replace_object(&child).await {
            Ok(()) => {
                info!(source = %relation, ?mode, "updated scrape annotations");
                entries.push(LedgerEntry::ok(relation, Outcome::Updated));
            }
            Err(e) if e.is_not_found() => {
                debug!(source = %relation, "source disappeared before update");
            }
            Err(e) => {
                warn!(source = %relation, error = %e, "failed to update scrape annotations");
                entries.push(LedgerEntry::failed(Some(relation), e.into()));
            }
        }
    }

    entries
}

// =============================================================================
// Shared scrape document
// =============================================================================

/// ConfigMap relation for a located scrape document
pub fn document_relation(config_map: &ConfigMap) -> QualifiedResourceRelation {
    QualifiedResourceRelation::new(
        "v1",
        "ConfigMap",
        config_map.namespace().unwrap_or_default(),
        config_map.name_any(),
        RelationRole::Scraper,
    )
}

/// Find the ConfigMap mounted by a scraper deployment.
///
/// `None` if the deployment, its config volume, or the ConfigMap is absent.
pub async fn locate_document(
    kube: &dyn KubeClient,
    namespace: &str,
    deployment: &str,
) -> Result<Option<ConfigMap>, Error> {
    let Some(scraper) = kube.get_deployment(namespace, deployment).await? else {
        debug!(%namespace, %deployment, "scraper deployment not found");
        return Ok(None);
    };
    let Some(config_map) = config_map_name(&scraper) else {
        debug!(%namespace, %deployment, "scraper deployment mounts no config volume");
        return Ok(None);
    };
    kube.get_config_map(namespace, &config_map).await
}

/// Parse the scrape document stored in a ConfigMap
pub fn read_document(config_map: &ConfigMap) -> Result<ScrapeConfigDocument, Error> {
    let text = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIG_KEY))
        .map(String::as_str)
        .unwrap_or_default();
    ScrapeConfigDocument::parse(text)
}

/// Remove this trait's jobs from `start_index` upwards until one is missing
pub fn remove_jobs_from(
    document: ScrapeConfigDocument,
    metrics_trait: &MetricsTrait,
    cluster: Option<&str>,
    start_index: usize,
) -> Result<ScrapeConfigDocument, Error> {
    let mut document = document;
    let mut index = start_index;
    loop {
        let name = job_name(metrics_trait, cluster, index)?;
        if !document.contains_job(&name) {
            return Ok(document);
        }
        document = document.merge_job(&name, None);
        index += 1;
    }
}

/// Store an updated document if it differs from the original
pub async fn write_document(
    kube: &dyn KubeClient,
    mut config_map: ConfigMap,
    original: &ScrapeConfigDocument,
    updated: &ScrapeConfigDocument,
) -> Result<Outcome, Error> {
    if updated.same_content(original) {
        debug!(config_map = %config_map.name_any(), "scrape document unchanged");
        return Ok(Outcome::Unchanged);
    }
    config_map
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(CONFIG_KEY.to_string(), updated.to_yaml()?);
    kube.replace_config_map(&config_map).await?;
    info!(config_map = %config_map.name_any(), "updated scrape document");
    Ok(Outcome::Updated)
}

/// Merge this trait's jobs into the built-in scraper's shared document
pub async fn sync_config_document(pass: &TraitPass<'_>) -> Vec<LedgerEntry> {
    let scraper = pass.scraper();
    let Some((namespace, deployment)) = scraper.split_once('/') else {
        return scraper_failure(
            pass.metrics_trait,
            Error::validation_for(
                pass.metrics_trait.name_any(),
                format!("scraper {scraper:?} is not namespace/name"),
            ),
        );
    };

    let config_map = match locate_document(pass.kube, namespace, deployment).await {
        Ok(Some(cm)) => cm,
        Ok(None) => {
            debug!(%scraper, "no scrape document to update");
            return Vec::new();
        }
        Err(e) => return scraper_failure(pass.metrics_trait, e),
    };

    let relation = document_relation(&config_map);
    match update_document(pass, config_map).await {
        Ok(outcome) => vec![LedgerEntry::ok(relation, outcome)],
        Err(e) if e.is_conflict() => {
            info!(scraper = %relation, "scrape document changed concurrently, retrying later");
            vec![LedgerEntry::failed(Some(relation), e.into())]
        }
        Err(e) => {
            warn!(scraper = %relation, error = %e, "failed to update scrape document");
            vec![LedgerEntry::failed(Some(relation), e.into())]
        }
    }
}

async fn update_document(pass: &TraitPass<'_>, config_map: ConfigMap) -> Result<Outcome, Error> {
    let original = read_document(&config_map)?;
    let active = pass.is_active();

    let (https, credentials) = if active {
        (pass.uses_https().await?, pass.credentials().await?)
    } else {
        (false, None)
    };

    let app = pass.metrics_trait.app_name().unwrap_or_default();
    let component = pass.metrics_trait.component_name().unwrap_or_default();
    let namespace = pass.namespace();
    let template = if pass.kind == WorkloadKind::WebLogic {
        JobTemplate::WebLogic
    } else {
        JobTemplate::Standard
    };

    let mut document = original.clone();
    for port_index in 0..pass.ports.len() {
        let name = job_name(pass.metrics_trait, pass.cluster, port_index)?;
        let job = if active {
            Some(synthesize_job(&JobParams {
                job_name: &name,
                app,
                component,
                namespace: &namespace,
                port_index,
                cluster_name: pass.cluster.unwrap_or(LOCAL_CLUSTER_NAME),
                https,
                template,
                credentials: credentials.as_ref(),
            })?)
        } else {
            None
        };
        document = document.merge_job(&name, job);
    }
    let document = remove_jobs_from(document, pass.metrics_trait, pass.cluster, pass.ports.len())?;

    write_document(pass.kube, config_map, &original, &document).await
}

// =============================================================================
// ServiceMonitor
// =============================================================================

/// Create, update or delete this trait's ServiceMonitor
pub async fn sync_service_monitor(pass: &TraitPass<'_>) -> Vec<LedgerEntry> {
    let name = match service_monitor_name(pass.metrics_trait, pass.cluster) {
        Ok(name) => name,
        Err(e) => return scraper_failure(pass.metrics_trait, e),
    };
    let namespace = pass.namespace();
    let relation = QualifiedResourceRelation::new(
        ServiceMonitor::API_VERSION,
        ServiceMonitor::KIND,
        &namespace,
        &name,
        RelationRole::Scraper,
    );

    let result = if pass.is_active() {
        apply_monitor(pass, &name, &namespace).await
    } else {
        delete_monitor(pass.kube, &namespace, &name).await
    };

    match result {
        Ok(outcome) => vec![LedgerEntry::ok(relation, outcome)],
        Err(e) => {
            warn!(scraper = %relation, error = %e, "failed to sync ServiceMonitor");
            vec![LedgerEntry::failed(Some(relation), e.into())]
        }
    }
}

async fn apply_monitor(pass: &TraitPass<'_>, name: &str, namespace: &str) -> Result<Outcome, Error> {
    let https = pass.uses_https().await?;
    let secret = match pass.credentials().await? {
        Some(_) => secret_name(pass.metrics_trait, pass.defaults),
        None => None,
    };

    let desired = build_service_monitor(&MonitorParams {
        name,
        namespace,
        app: pass.metrics_trait.app_name().unwrap_or_default(),
        component: pass.metrics_trait.component_name().unwrap_or_default(),
        cluster_name: pass.cluster.unwrap_or(LOCAL_CLUSTER_NAME),
        ports: pass.ports,
        defaults: pass.defaults,
        secret,
        https,
    });

    let existing = pass.kube.get_service_monitor(namespace, name).await?;
    if existing.as_ref().is_some_and(|e| is_up_to_date(e, &desired)) {
        debug!(service_monitor = %name, "ServiceMonitor up to date");
        return Ok(Outcome::Unchanged);
    }

    pass.kube.apply_service_monitor(&desired).await?;
    info!(service_monitor = %name, "applied ServiceMonitor");
    Ok(if existing.is_some() {
        Outcome::Updated
    } else {
        Outcome::Created
    })
}

/// Delete a ServiceMonitor; absence counts as success
pub async fn delete_monitor(
    kube: &dyn KubeClient,
    namespace: &str,
    name: &str,
) -> Result<Outcome, Error> {
    if kube.delete_service_monitor(namespace, name).await? {
        info!(service_monitor = %name, "deleted ServiceMonitor");
        Ok(Outcome::Updated)
    } else {
        Ok(Outcome::Unchanged)
    }
}

// =============================================================================
// Owners
// =============================================================================

/// Owner relations for every ApplicationConfiguration that embeds the trait
pub fn owner_relations(metrics_trait: &MetricsTrait) -> Vec<LedgerEntry> {
    let namespace = metrics_trait.namespace().unwrap_or_default();
    metrics_trait
        .owner_references()
        .iter()
        .filter(|o| o.kind == APP_CONFIG_KIND)
        .map(|o| {
            LedgerEntry::ok(
                QualifiedResourceRelation::new(
                    &o.api_version,
                    &o.kind,
                    &namespace,
                    &o.name,
                    RelationRole::Owner,
                ),
                Outcome::Unchanged,
            )
        })
        .collect()
}
