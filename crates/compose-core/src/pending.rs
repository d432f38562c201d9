//! Lock-free accumulator of state modifications.
//!
//! Producers on any thread append sets of changed state ids; the owning
//! composition drains them on its own thread before composing and after
//! applying changes.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::collections::map::HashSet;
use crate::snapshot::StateId;

pub type ModifiedSet = Arc<HashSet<StateId>>;

#[derive(Clone, Debug, Default)]
pub enum PendingModifications {
    /// Nothing recorded and no composition awaiting apply.
    #[default]
    Empty,
    /// A composition ran and its changes have not been applied yet.
    NoModificationsPending,
    One(ModifiedSet),
    Many(Vec<ModifiedSet>),
}

impl PendingModifications {
    fn with(&self, values: ModifiedSet) -> Self {
        match self {
            PendingModifications::Empty | PendingModifications::NoModificationsPending => {
                PendingModifications::One(values)
            }
            PendingModifications::One(first) => PendingModifications::Many(vec![first.clone(), values]),
            PendingModifications::Many(sets) => {
                let mut sets = sets.clone();
                sets.push(values);
                PendingModifications::Many(sets)
            }
        }
    }

    fn into_sets(self) -> Vec<ModifiedSet> {
        match self {
            PendingModifications::One(set) => vec![set],
            PendingModifications::Many(sets) => sets,
            _ => Vec::new(),
        }
    }

    pub fn has_values(&self) -> bool {
        matches!(self, PendingModifications::One(_) | PendingModifications::Many(_))
    }
}

/// Shared slot holding the pending modifications of one composition.
#[derive(Clone, Default)]
pub(crate) struct PendingSlot {
    cell: Arc<ArcSwap<PendingModifications>>,
}

impl PendingSlot {
    /// Appends `values`. Returns `true` if the slot was idle, in which case
    /// the caller should drain it right away.
    pub(crate) fn record(&self, values: ModifiedSet) -> bool {
        let previous = self.cell.rcu(|current| Arc::new(current.with(values.clone())));
        matches!(*previous, PendingModifications::Empty)
    }

    pub(crate) fn has_values(&self) -> bool {
        self.cell.load().has_values()
    }

    /// Drains before a composition pass and marks the slot as awaiting apply.
    pub(crate) fn drain_for_composition(&self) -> Vec<ModifiedSet> {
        let previous = self.cell.swap(Arc::new(PendingModifications::NoModificationsPending));
        match &*previous {
            PendingModifications::NoModificationsPending => {
                panic!("pending composition has not been applied")
            }
            other => other.clone().into_sets(),
        }
    }

    /// Drains after changes were applied, or after a pass that did nothing.
    pub(crate) fn drain(&self) -> Vec<ModifiedSet> {
        let previous = self.cell.swap(Arc::new(PendingModifications::Empty));
        match &*previous {
            PendingModifications::Empty => {
                panic!("calling record_modifications_of and apply_changes concurrently is not supported")
            }
            other => other.clone().into_sets(),
        }
    }

    /// Leaves the awaiting-apply state after a pass was abandoned. Values
    /// recorded meanwhile are kept for the next pass.
    pub(crate) fn abandon_pass(&self) {
        self.cell.rcu(|current| match &**current {
            PendingModifications::NoModificationsPending => Arc::new(PendingModifications::Empty),
            _ => current.clone(),
        });
    }

    pub(crate) fn recorder(&self) -> ModificationRecorder {
        ModificationRecorder { slot: self.clone() }
    }
}

/// Handle for recording modifications from other threads. The composition
/// picks them up the next time it composes.
#[derive(Clone)]
pub struct ModificationRecorder {
    slot: PendingSlot,
}

impl ModificationRecorder {
    pub fn record_modifications_of(&self, values: HashSet<StateId>) {
        if values.is_empty() {
            return;
        }
        self.slot.record(Arc::new(values));
    }

    pub fn has_pending(&self) -> bool {
        self.slot.has_values()
    }
}
