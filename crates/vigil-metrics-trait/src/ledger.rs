//! Per-pass record of every side effect the controller attempted
//!
//! Sub-steps return their entries; the controller combines them into one
//! [`Ledger`] that the reaper and status reporter read.

use vigil_common::crd::QualifiedResourceRelation;
use vigil_common::ReconcileError;

/// What a mutating step did to its object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Object already matched the desired state
    Unchanged,
    /// Object was created
    Created,
    /// Object was updated or deleted
    Updated,
}

/// One attempted side effect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Object touched; absent when the step failed before identifying it
    pub relation: Option<QualifiedResourceRelation>,
    /// Result of a successful step
    pub outcome: Outcome,
    /// Failure, if any
    pub error: Option<ReconcileError>,
}

impl LedgerEntry {
    /// Successful step
    pub fn ok(relation: QualifiedResourceRelation, outcome: Outcome) -> Self {
        Self {
            relation: Some(relation),
            outcome,
            error: None,
        }
    }

    /// Failed step
    pub fn failed(relation: Option<QualifiedResourceRelation>, error: ReconcileError) -> Self {
        Self {
            relation,
            outcome: Outcome::Unchanged,
            error: Some(error),
        }
    }
}

/// Ordered entries for one reconcile pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Relations reproduced this pass, deduplicated, in first-seen order.
    /// Failed entries count: their object is still owned.
    pub fn relations(&self) -> Vec<QualifiedResourceRelation> {
        let mut out: Vec<QualifiedResourceRelation> = Vec::new();
        for relation in self.entries.iter().filter_map(|e| e.relation.as_ref()) {
            if !out.contains(relation) {
                out.push(relation.clone());
            }
        }
        out
    }

    /// True if the relation was reproduced this pass
    pub fn contains(&self, relation: &QualifiedResourceRelation) -> bool {
        self.entries
            .iter()
            .any(|e| e.relation.as_ref() == Some(relation))
    }

    /// First recorded failure
    pub fn first_error(&self) -> Option<&ReconcileError> {
        self.entries.iter().find_map(|e| e.error.as_ref())
    }
}

impl Extend<LedgerEntry> for Ledger {
    fn extend<I: IntoIterator<Item = LedgerEntry>>(&mut self, iter: I) {
        self.entries.extend(iter);
    }
}

impl FromIterator<LedgerEntry> for Ledger {
    fn from_iter<I: IntoIterator<Item = LedgerEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
