//! State tracking.
//!
//! Reads and writes of observable state are routed through the data sources
//! registered in a [`DataSourceRegistry`]. The [`SnapshotSystem`] is the
//! built-in source: it reports reads to the active observer and buffers
//! writes made inside an isolation until the isolation completes.

mod data_source;
mod state;
mod system;

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

pub use data_source::{
    DataSource, DataSourceRegistry, IsolationOutcome, ObserverHandle, RecordChange, RecordDependency,
};
pub use state::{DerivedState, MutableState, MutationPolicy, NeverEqual, StructuralEquality};
pub use system::SnapshotSystem;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an observable value. Generated, never derived from addresses.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u64);

impl StateId {
    pub fn next() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Something a composition can observe.
pub trait StateObject {
    fn state_id(&self) -> StateId;

    /// Monotonic counter that changes whenever the committed value changes.
    fn version(&self) -> u64;

    fn as_derived(&self) -> Option<&dyn DerivedStateObject> {
        None
    }
}

pub type StateRef = Rc<dyn StateObject>;

/// A memoized calculation over other state objects.
pub trait DerivedStateObject {
    /// Dependencies read by the most recent calculation.
    fn dependencies(&self) -> Vec<StateRef>;

    /// Revision of the memoized value, recalculating first if a dependency
    /// changed. The revision only moves when the value itself changes.
    fn current_revision(&self) -> u64;
}
