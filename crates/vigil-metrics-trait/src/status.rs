//! Status reporting: the merged relation set and one rolled-up condition

use kube::ResourceExt;
use tracing::debug;

use vigil_common::crd::{
    Condition, ConditionStatus, MetricsTrait, MetricsTraitStatus, QualifiedResourceRelation,
};
use vigil_common::{Error, ReconcileError};

use crate::client::KubeClient;
use crate::ledger::Ledger;
use crate::reaper::Teardown;

/// Condition type reporting the outcome of the last reconcile
pub const CONDITION_SYNCED: &str = "Synced";
/// Reason for a clean pass
pub const REASON_SUCCESS: &str = "ReconcileSuccess";
/// Reason for a pass with at least one error
pub const REASON_ERROR: &str = "ReconcileError";

/// First failure of the pass: ledger entries before teardowns
pub fn first_error<'a>(ledger: &'a Ledger, teardowns: &'a [Teardown]) -> Option<&'a ReconcileError> {
    ledger
        .first_error()
        .or_else(|| teardowns.iter().find_map(|t| t.result.as_ref().err()))
}

/// Build the status to persist.
///
/// Relations are this pass's ledger plus previous relations whose teardown
/// failed. The condition keeps its transition time when its state is
/// unchanged.
pub fn build_status(
    ledger: &Ledger,
    teardowns: &[Teardown],
    current: Option<&MetricsTraitStatus>,
) -> MetricsTraitStatus {
    let mut relations = ledger.relations();
    for teardown in teardowns.iter().filter(|t| t.failed()) {
        if !relations.contains(&teardown.relation) {
            relations.push(teardown.relation.clone());
        }
    }

    let condition = match first_error(ledger, teardowns) {
        Some(error) => Condition::new(
            CONDITION_SYNCED,
            ConditionStatus::False,
            REASON_ERROR,
            error.to_string(),
        ),
        None => Condition::new(CONDITION_SYNCED, ConditionStatus::True, REASON_SUCCESS, ""),
    };
    let condition = current
        .and_then(|s| s.conditions.iter().find(|c| c.same_state(&condition)))
        .cloned()
        .unwrap_or(condition);

    MetricsTraitStatus {
        conditions: vec![condition],
        resource_relations: relations,
    }
}

/// True if persisting `desired` would change nothing observable
pub fn is_status_unchanged(current: Option<&MetricsTraitStatus>, desired: &MetricsTraitStatus) -> bool {
    let Some(current) = current else {
        return false;
    };
    same_relations(&current.resource_relations, &desired.resource_relations)
        && current.conditions.len() == desired.conditions.len()
        && current
            .conditions
            .iter()
            .zip(&desired.conditions)
            .all(|(a, b)| a.same_state(b))
}

fn same_relations(a: &[QualifiedResourceRelation], b: &[QualifiedResourceRelation]) -> bool {
    let mut a: Vec<&QualifiedResourceRelation> = a.iter().collect();
    let mut b: Vec<&QualifiedResourceRelation> = b.iter().collect();
    a.sort();
    b.sort();
    a == b
}

/// Persist the status unless it is unchanged.
///
/// A trait that vanished mid-deletion has no status left to write.
pub async fn update_status(
    kube: &dyn KubeClient,
    metrics_trait: &MetricsTrait,
    desired: &MetricsTraitStatus,
) -> Result<(), Error> {
    if is_status_unchanged(metrics_trait.status.as_ref(), desired) {
        debug!("status unchanged, skipping update");
        return Ok(());
    }

    let name = metrics_trait.name_any();
    let namespace = metrics_trait.namespace().unwrap_or_default();
    match kube.patch_trait_status(&namespace, &name, desired).await {
        Err(e) if e.is_not_found() && metrics_trait.is_deleting() => {
            debug!("trait gone before status update");
            Ok(())
        }
        other => other,
    }
}
