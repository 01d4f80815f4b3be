//! Teardown of relations a trait no longer reproduces
//!
//! Anything in the trait's previous relation set that this pass's ledger does
//! not contain is undone by role. A relation that tears down cleanly, or is
//! already gone, is dropped; a failure keeps it for the next pass.

use kube::api::DynamicObject;
use serde_json::Value;
use tracing::{debug, info, warn};

use vigil_common::crd::{MetricsTrait, QualifiedResourceRelation, RelationRole, ServiceMonitor};
use vigil_common::kube_utils::HasApiResource;
use vigil_common::{Error, ReconcileError};

use crate::client::KubeClient;
use crate::ledger::Ledger;
use crate::naming::job_name;
use crate::source::revert_source;
use crate::sync::{delete_monitor, locate_document, read_document, remove_jobs_from, write_document};

/// Kind of the trait as embedded in an ApplicationConfiguration
const METRICS_TRAIT_KIND: &str = "MetricsTrait";

/// Result of tearing down one obsolete relation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Teardown {
    /// Relation that was torn down
    pub relation: QualifiedResourceRelation,
    /// Failure, if the relation must be kept for another attempt
    pub result: Result<(), ReconcileError>,
}

impl Teardown {
    /// True if the relation must be kept for another attempt
    pub fn failed(&self) -> bool {
        self.result.is_err()
    }
}

/// Tear down every previous relation the ledger does not contain
pub async fn reap(
    kube: &dyn KubeClient,
    metrics_trait: &MetricsTrait,
    ledger: &Ledger,
    cluster: Option<&str>,
) -> Vec<Teardown> {
    let mut teardowns = Vec::new();
    for relation in metrics_trait.previous_relations() {
        if ledger.contains(relation) {
            continue;
        }

        let result = match relation.role {
            RelationRole::Scraper => teardown_scraper(kube, metrics_trait, relation, cluster).await,
            RelationRole::Source => teardown_source(kube, metrics_trait, relation).await,
            RelationRole::Owner => teardown_owner(kube, metrics_trait, relation).await,
            RelationRole::Unknown => {
                debug!(%relation, "dropping relation with unknown role");
                Ok(())
            }
        };

        match &result {
            Ok(()) => debug!(%relation, "tore down obsolete relation"),
            Err(e) => warn!(%relation, error = %e, "failed to tear down obsolete relation"),
        }
        teardowns.push(Teardown {
            relation: relation.clone(),
            result: result.map_err(ReconcileError::from),
        });
    }
    teardowns
}

async fn teardown_scraper(
    kube: &dyn KubeClient,
    metrics_trait: &MetricsTrait,
    relation: &QualifiedResourceRelation,
    cluster: Option<&str>,
) -> Result<(), Error> {
    let config_map = match relation.kind.as_str() {
        "ConfigMap" => kube.get_config_map(&relation.namespace, &relation.name).await?,
        // Relations written before the ConfigMap was recorded name the scraper deployment
        "Deployment" => locate_document(kube, &relation.namespace, &relation.name).await?,
        kind if kind == ServiceMonitor::KIND => {
            delete_monitor(kube, &relation.namespace, &relation.name).await?;
            return Ok(());
        }
        other => {
            debug!(kind = %other, "no teardown for scraper kind");
            return Ok(());
        }
    };
    let Some(config_map) = config_map else {
        return Ok(());
    };

    // Without identity labels no job could have been written
    if job_name(metrics_trait, cluster, 0).is_err() {
        debug!("trait has no identity labels, no scrape jobs to remove");
        return Ok(());
    }

    let original = read_document(&config_map)?;
    let document = remove_jobs_from(original.clone(), metrics_trait, cluster, 0)?;
    write_document(kube, config_map, &original, &document).await?;
    Ok(())
}

async fn teardown_source(
    kube: &dyn KubeClient,
    metrics_trait: &MetricsTrait,
    relation: &QualifiedResourceRelation,
) -> Result<(), Error> {
    let Some(mut child) = get_related(kube, relation).await? else {
        return Ok(());
    };
    if revert_source(&mut child, metrics_trait) != Some(true) {
        return Ok(());
    }
    replace_tolerating_absence(kube, &child).await?;
    info!(source = %relation, "reverted scrape annotations");
    Ok(())
}

async fn teardown_owner(
    kube: &dyn KubeClient,
    metrics_trait: &MetricsTrait,
    relation: &QualifiedResourceRelation,
) -> Result<(), Error> {
    let Some(component) = metrics_trait.component_name() else {
        return Ok(());
    };
    let Some(mut owner) = get_related(kube, relation).await? else {
        return Ok(());
    };
    if !strip_embedded_trait(&mut owner.data, component) {
        return Ok(());
    }
    replace_tolerating_absence(kube, &owner).await?;
    info!(owner = %relation, %component, "removed embedded trait from owner");
    Ok(())
}

async fn get_related(
    kube: &dyn KubeClient,
    relation: &QualifiedResourceRelation,
) -> Result<Option<DynamicObject>, Error> {
    kube.get_object(
        &relation.api_version,
        &relation.kind,
        &relation.namespace,
        &relation.name,
    )
    .await
}

async fn replace_tolerating_absence(kube: &dyn KubeClient, obj: &DynamicObject) -> Result<(), Error> {
    match kube.replace_object(obj).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Remove embedded MetricsTraits from the named component of an
/// ApplicationConfiguration. Returns whether anything was removed.
fn strip_embedded_trait(app_config: &mut Value, component: &str) -> bool {
    let Some(components) = app_config
        .pointer_mut("/spec/components")
        .and_then(Value::as_array_mut)
    else {
        return false;
    };

    let mut removed = false;
    for entry in components
        .iter_mut()
        .filter(|c| c.get("componentName").and_then(Value::as_str) == Some(component))
    {
        let Some(traits) = entry.get_mut("traits").and_then(Value::as_array_mut) else {
            continue;
        };
        let before = traits.len();
        traits.retain(|t| t.pointer("/trait/kind").and_then(Value::as_str) != Some(METRICS_TRAIT_KIND));
        removed |= traits.len() != before;
    }
    removed
}
