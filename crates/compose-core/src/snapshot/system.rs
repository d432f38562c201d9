use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use super::data_source::{DataSource, DataSourceRegistry, IsolationOutcome, ObserverHandle, RecordChange, RecordDependency, WeakRegistry};
use super::state::{DerivedState, MutableState, MutationPolicy, StructuralEquality};
use super::{StateId, StateRef};
use crate::collections::map::{HashMap, HashSet};

/// Target of a buffered write.
pub(crate) trait Commit {
    fn commit(&self, value: Rc<dyn Any>);
}

struct PendingWrite {
    target: Rc<dyn Commit>,
    value: Rc<dyn Any>,
}

#[derive(Default)]
struct IsolationLayer {
    record_change: Option<RecordChange>,
    writes: HashMap<StateId, PendingWrite>,
    order: Vec<StateId>,
}

impl IsolationLayer {
    fn put(&mut self, id: StateId, write: PendingWrite) {
        if self.writes.insert(id, write).is_none() {
            self.order.push(id);
        }
    }
}

/// Built-in data source for [`MutableState`] and [`DerivedState`].
///
/// Observations and isolations are stacks; the tokens handed out are the
/// stack depth at entry, and exiting truncates back to it.
pub struct SnapshotSystem {
    registry: WeakRegistry,
    observers: RefCell<Vec<Option<RecordDependency>>>,
    isolations: RefCell<Vec<IsolationLayer>>,
}

impl SnapshotSystem {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            registry: WeakRegistry::default(),
            observers: RefCell::new(Vec::new()),
            isolations: RefCell::new(Vec::new()),
        })
    }

    /// Creates a system and registers it with `registry`. Published writes
    /// are forwarded to the registry's invalidators.
    pub fn install(registry: &DataSourceRegistry) -> (Rc<Self>, ObserverHandle) {
        let system = Rc::new(Self {
            registry: registry.downgrade(),
            observers: RefCell::new(Vec::new()),
            isolations: RefCell::new(Vec::new()),
        });
        let handle = registry.register(system.clone());
        (system, handle)
    }

    pub fn mutable_state_of<T: Clone + PartialEq + 'static>(self: &Rc<Self>, value: T) -> MutableState<T> {
        MutableState::new(self.clone(), value, Rc::new(StructuralEquality))
    }

    pub fn mutable_state_with_policy<T: Clone + 'static>(
        self: &Rc<Self>,
        value: T,
        policy: Rc<dyn MutationPolicy<T>>,
    ) -> MutableState<T> {
        MutableState::new(self.clone(), value, policy)
    }

    pub fn derived_state_of<T: Clone + PartialEq + 'static>(
        self: &Rc<Self>,
        compute: impl Fn() -> T + 'static,
    ) -> DerivedState<T> {
        DerivedState::new(self.clone(), Rc::new(compute), Rc::new(StructuralEquality))
    }

    pub fn is_isolated(&self) -> bool {
        !self.isolations.borrow().is_empty()
    }

    pub(crate) fn report_read(&self, state: &StateRef) {
        let observer = self.observers.borrow().last().cloned().flatten();
        if let Some(observer) = observer {
            observer(state);
        }
    }

    /// Runs `block` with reads reported to `record` instead of the current
    /// observer. Used to collect the dependencies of a derived calculation.
    pub(crate) fn collect_reads<R>(&self, record: RecordDependency, block: impl FnOnce() -> R) -> R {
        let depth = self.start_observation(record);
        struct Restore<'a>(&'a SnapshotSystem, usize);
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.0.end_observation(self.1);
            }
        }
        let _restore = Restore(self, depth);
        block()
    }

    pub(crate) fn isolated_value(&self, id: StateId) -> Option<Rc<dyn Any>> {
        self.isolations
            .borrow()
            .iter()
            .rev()
            .find_map(|layer| layer.writes.get(&id).map(|write| write.value.clone()))
    }

    pub(crate) fn has_isolated_write(&self, id: StateId) -> bool {
        self.isolations
            .borrow()
            .iter()
            .any(|layer| layer.writes.contains_key(&id))
    }

    /// Records a write. Inside an isolation the value is buffered in the
    /// innermost layer; otherwise it is committed and published at once.
    pub(crate) fn write(&self, state: StateRef, target: Rc<dyn Commit>, value: Rc<dyn Any>) {
        let id = state.state_id();
        let mut pending = Some(PendingWrite { target, value });
        let record_change = {
            let mut isolations = self.isolations.borrow_mut();
            isolations.last_mut().map(|layer| {
                if let Some(write) = pending.take() {
                    layer.put(id, write);
                }
                layer.record_change.clone()
            })
        };
        match record_change {
            Some(Some(record_change)) => record_change(&state),
            Some(None) => {}
            None => {
                if let Some(write) = pending.take() {
                    write.target.commit(write.value);
                }
                let mut changed = HashSet::default();
                changed.insert(id);
                self.publish(&changed);
            }
        }
    }

    fn publish(&self, changed: &HashSet<StateId>) {
        log::trace!("publishing {} changed state object(s)", changed.len());
        if let Some(registry) = self.registry.upgrade() {
            registry.invalidate_dependants(changed);
        }
    }
}

impl DataSource for SnapshotSystem {
    type Observation = usize;
    type Isolation = usize;

    fn start_observation(&self, record_dependency: RecordDependency) -> usize {
        let mut observers = self.observers.borrow_mut();
        observers.push(Some(record_dependency));
        observers.len() - 1
    }

    fn end_observation(&self, previous: usize) {
        let mut observers = self.observers.borrow_mut();
        assert_eq!(observers.len(), previous + 1, "observations must end in reverse order");
        observers.truncate(previous);
    }

    fn pause_current_observation(&self) -> usize {
        let mut observers = self.observers.borrow_mut();
        observers.push(None);
        observers.len() - 1
    }

    fn resume_current_observation(&self, paused: usize) {
        self.end_observation(paused);
    }

    fn start_isolation(&self, record_change: Option<RecordChange>) -> usize {
        let mut isolations = self.isolations.borrow_mut();
        isolations.push(IsolationLayer {
            record_change,
            ..IsolationLayer::default()
        });
        isolations.len() - 1
    }

    fn end_isolation(&self, outcome: IsolationOutcome, previous: usize) {
        let layer = {
            let mut isolations = self.isolations.borrow_mut();
            assert_eq!(isolations.len(), previous + 1, "isolations must end in reverse order");
            match isolations.pop() {
                Some(layer) => layer,
                None => return,
            }
        };
        if outcome == IsolationOutcome::Failed {
            log::debug!("discarding {} isolated write(s)", layer.order.len());
            return;
        }
        let IsolationLayer { mut writes, order, .. } = layer;
        let mut isolations = self.isolations.borrow_mut();
        if let Some(parent) = isolations.last_mut() {
            for id in order {
                if let Some(write) = writes.remove(&id) {
                    parent.put(id, write);
                }
            }
            return;
        }
        drop(isolations);
        let mut changed = HashSet::default();
        for id in order {
            if let Some(write) = writes.remove(&id) {
                write.target.commit(write.value);
                changed.insert(id);
            }
        }
        if !changed.is_empty() {
            self.publish(&changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_system() -> (DataSourceRegistry, Rc<SnapshotSystem>, ObserverHandle) {
        let registry = DataSourceRegistry::new();
        let (system, handle) = SnapshotSystem::install(&registry);
        (registry, system, handle)
    }

    #[test]
    fn isolated_writes_are_invisible_until_completed() {
        let (registry, system, _handle) = registry_with_system();
        let state = system.mutable_state_of(1);
        let published = Rc::new(RefCell::new(Vec::new()));
        let sink = published.clone();
        let _invalidator = registry.register_invalidator(move |ids| sink.borrow_mut().push(ids.len()));

        registry.isolate(None, || {
            state.set(2);
            assert_eq!(state.get(), 2);
            assert_eq!(state.committed(), 1);
            assert!(published.borrow().is_empty());
        });

        assert_eq!(state.get(), 2);
        assert_eq!(*published.borrow(), vec![1]);
    }

    #[test]
    fn failed_isolation_discards_writes() {
        let (registry, system, _handle) = registry_with_system();
        let state = system.mutable_state_of(String::from("a"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            registry.isolate(None, || {
                state.set("b".to_string());
                panic!("composition failed");
            })
        }));
        assert!(result.is_err());
        assert_eq!(state.get(), "a");
        assert!(!system.is_isolated());
    }

    #[test]
    fn nested_isolation_merges_into_parent() {
        let (registry, system, _handle) = registry_with_system();
        let state = system.mutable_state_of(0);
        let changes = Rc::new(RefCell::new(0));
        let counter = changes.clone();
        let record: RecordChange = Rc::new(move |_| *counter.borrow_mut() += 1);
        registry.isolate(Some(record), || {
            registry.isolate(None, || state.set(5));
            assert_eq!(state.get(), 5);
            assert_eq!(state.committed(), 0);
        });
        assert_eq!(state.committed(), 5);
        assert_eq!(*changes.borrow(), 0);
    }

    #[test]
    fn reads_are_reported_only_while_observing() {
        let (registry, system, _handle) = registry_with_system();
        let state = system.mutable_state_of(3);
        let reads = Rc::new(RefCell::new(Vec::new()));
        let sink = reads.clone();
        let record: RecordDependency = Rc::new(move |state: &StateRef| {
            sink.borrow_mut().push(state.state_id());
            true
        });
        state.get();
        registry.observe(record, || {
            state.get();
            registry.without_read_observation(|| state.get());
        });
        assert_eq!(*reads.borrow(), vec![state.id()]);
    }
}
