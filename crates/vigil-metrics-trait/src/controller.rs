//! MetricsTrait controller implementation
//!
//! Reconciles a MetricsTrait through two states. An active trait gets its
//! finalizer, has its workload resolved and classified, and then syncs scrape
//! annotations plus either the shared scrape document or a ServiceMonitor.
//! A deleting trait tears down everything it previously recorded and only
//! then releases its finalizer.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use rand::Rng;
use tracing::{debug, error, info, instrument};

use vigil_common::crd::MetricsTrait;
use vigil_common::{
    ReconcileError, DEFAULT_RESERVED_NAMESPACES, LEGACY_SCRAPER, REQUEUE_ERROR_SECS,
    REQUEUE_SUCCESS_MAX_SECS, REQUEUE_SUCCESS_MIN_SECS,
};

use crate::client::{KubeClient, KubeClientImpl, FINALIZER};
use crate::cluster::{ClusterNameProvider, KubeClusterNameProvider};
use crate::defaults::{resolve_ports, WorkloadKind};
use crate::ledger::Ledger;
use crate::reaper::reap;
use crate::status::{build_status, first_error, update_status};
use crate::sync::{
    owner_relations, sync_config_document, sync_service_monitor, sync_sources, ScraperMode,
    TraitPass,
};
use crate::workload::{type_meta, KubeWorkloadResolver, WorkloadResolver};

// =============================================================================
// Configuration and context
// =============================================================================

/// Operator-level settings for the MetricsTrait controller
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Scraper identity (`namespace/name`) used when a trait names none
    pub scraper: String,
    /// Namespaces whose traits are ignored
    pub reserved_namespaces: Vec<String>,
    /// Delay before retrying a failed pass
    pub error_requeue: Duration,
    /// Lower bound of the jittered requeue after a clean pass, in seconds
    pub success_requeue_min_secs: u64,
    /// Upper bound of the jittered requeue after a clean pass, in seconds
    pub success_requeue_max_secs: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            scraper: LEGACY_SCRAPER.to_string(),
            reserved_namespaces: DEFAULT_RESERVED_NAMESPACES
                .iter()
                .map(|ns| ns.to_string())
                .collect(),
            error_requeue: Duration::from_secs(REQUEUE_ERROR_SECS),
            success_requeue_min_secs: REQUEUE_SUCCESS_MIN_SECS,
            success_requeue_max_secs: REQUEUE_SUCCESS_MAX_SECS,
        }
    }
}

impl ControllerConfig {
    /// True if traits in this namespace are never reconciled
    pub fn is_reserved_namespace(&self, namespace: &str) -> bool {
        self.reserved_namespaces.iter().any(|ns| ns == namespace)
    }

    /// Jittered delay before re-checking a trait that reconciled cleanly.
    ///
    /// Workload drift does not always trigger a watch event on the trait, so
    /// clean traits are revisited on a spread-out schedule.
    pub fn success_requeue(&self) -> Duration {
        let lo = self.success_requeue_min_secs.min(self.success_requeue_max_secs);
        let hi = self.success_requeue_min_secs.max(self.success_requeue_max_secs);
        Duration::from_secs(rand::thread_rng().gen_range(lo..=hi))
    }
}

/// Shared state for the MetricsTrait controller
pub struct Context {
    /// Object store access
    pub kube: Arc<dyn KubeClient>,
    /// Workload and child lookup
    pub workloads: Arc<dyn WorkloadResolver>,
    /// Managed cluster name lookup
    pub cluster_names: Arc<dyn ClusterNameProvider>,
    /// Operator settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a new context from its collaborators
    pub fn new(
        kube: Arc<dyn KubeClient>,
        workloads: Arc<dyn WorkloadResolver>,
        cluster_names: Arc<dyn ClusterNameProvider>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            kube,
            workloads,
            cluster_names,
            config,
        }
    }

    /// Create a context whose collaborators all read through one client
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client));
        Self {
            workloads: Arc::new(KubeWorkloadResolver::new(kube.clone())),
            cluster_names: Arc::new(KubeClusterNameProvider::new(kube.clone())),
            kube,
            config,
        }
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        workloads: Arc<dyn WorkloadResolver>,
        cluster_names: Arc<dyn ClusterNameProvider>,
    ) -> Self {
        Self::new(kube, workloads, cluster_names, ControllerConfig::default())
    }
}

// =============================================================================
// Reconcile
// =============================================================================

/// Reconcile a MetricsTrait
#[instrument(
    skip(metrics_trait, ctx),
    fields(
        metrics_trait = %metrics_trait.name_any(),
        namespace = %metrics_trait.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(
    metrics_trait: Arc<MetricsTrait>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    let namespace = metrics_trait.namespace().unwrap_or_default();
    if ctx.config.is_reserved_namespace(&namespace) {
        debug!("trait is in a reserved namespace, ignoring");
        return Ok(Action::await_change());
    }

    if metrics_trait.is_deleting() {
        reconcile_delete(&metrics_trait, &ctx).await
    } else {
        reconcile_active(&metrics_trait, &ctx).await
    }
}

async fn reconcile_active(
    metrics_trait: &MetricsTrait,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let name = metrics_trait.name_any();
    let namespace = metrics_trait.namespace().unwrap_or_default();

    if !has_finalizer(metrics_trait) {
        ctx.kube.add_finalizer(&namespace, &name, FINALIZER).await?;
        info!("added finalizer");
    }

    let Some(workload) = ctx.workloads.resolve(metrics_trait).await? else {
        debug!(
            workload = %metrics_trait.spec.workload_ref.name,
            "workload not found yet, retrying later"
        );
        return Ok(Action::requeue(ctx.config.error_requeue));
    };

    let kind = WorkloadKind::of(&workload);
    let Some(defaults) = kind.defaults(&workload, &ctx.config.scraper) else {
        let (api_version, workload_kind) = type_meta(&workload);
        info!(
            %api_version,
            kind = %workload_kind,
            "workload type does not support metrics, deleting trait"
        );
        ctx.kube.delete_trait(&namespace, &name).await?;
        return Ok(Action::await_change());
    };

    let cluster = ctx.cluster_names.cluster_name().await?;
    let ports = resolve_ports(metrics_trait, &defaults);
    let mode = ScraperMode::select(metrics_trait, &defaults);

    let mut ledger = Ledger::new();
    match mode {
        ScraperMode::Skip => {
            debug!("trait names the built-in scraper, leaving it to the ServiceMonitor path");
        }
        ScraperMode::ConfigDocument | ScraperMode::ServiceMonitor => {
            let children = ctx.workloads.children(&workload).await?;
            let pass = TraitPass {
                kube: ctx.kube.as_ref(),
                metrics_trait,
                kind,
                defaults: &defaults,
                ports: &ports,
                cluster: cluster.as_deref(),
            };
            ledger.extend(sync_sources(&pass, children).await);
            if mode == ScraperMode::ConfigDocument {
                ledger.extend(sync_config_document(&pass).await);
            } else {
                ledger.extend(sync_service_monitor(&pass).await);
            }
        }
    }
    ledger.extend(owner_relations(metrics_trait));

    settle(metrics_trait, ctx, &ledger, cluster.as_deref()).await?;

    let requeue = ctx.config.success_requeue();
    debug!(?mode, requeue_secs = requeue.as_secs(), "reconciled metrics trait");
    Ok(Action::requeue(requeue))
}

async fn reconcile_delete(
    metrics_trait: &MetricsTrait,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    if !has_finalizer(metrics_trait) {
        debug!("trait deleting without our finalizer, nothing to do");
        return Ok(Action::await_change());
    }

    let cluster = ctx.cluster_names.cluster_name().await?;
    settle(metrics_trait, ctx, &Ledger::new(), cluster.as_deref()).await?;

    let name = metrics_trait.name_any();
    let namespace = metrics_trait.namespace().unwrap_or_default();
    ctx.kube
        .remove_finalizer(&namespace, &name, FINALIZER)
        .await?;
    info!("teardown complete, removed finalizer");
    Ok(Action::await_change())
}

/// Reap obsolete relations, persist status, and fail if anything in the
/// pass failed
async fn settle(
    metrics_trait: &MetricsTrait,
    ctx: &Context,
    ledger: &Ledger,
    cluster: Option<&str>,
) -> Result<(), ReconcileError> {
    let teardowns = reap(ctx.kube.as_ref(), metrics_trait, ledger, cluster).await;
    let status = build_status(ledger, &teardowns, metrics_trait.status.as_ref());
    update_status(ctx.kube.as_ref(), metrics_trait, &status).await?;

    match first_error(ledger, &teardowns) {
        Some(error) => Err(error.clone()),
        None => Ok(()),
    }
}

fn has_finalizer(metrics_trait: &MetricsTrait) -> bool {
    metrics_trait.finalizers().iter().any(|f| f == FINALIZER)
}

/// Error policy for the controller
///
/// Every failure is retryable; the pass is re-run from scratch after a short
/// fixed delay.
pub fn error_policy(
    metrics_trait: Arc<MetricsTrait>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    error!(
        ?error,
        metrics_trait = %metrics_trait.name_any(),
        namespace = %metrics_trait.namespace().unwrap_or_default(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_requeue)
}
