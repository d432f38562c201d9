use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::system::{Commit, SnapshotSystem};
use super::{DerivedStateObject, StateId, StateObject, StateRef};

/// Decides whether a write changes a state object.
pub trait MutationPolicy<T> {
    fn equivalent(&self, a: &T, b: &T) -> bool;
}

pub struct StructuralEquality;

impl<T: PartialEq> MutationPolicy<T> for StructuralEquality {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Every write is a change.
pub struct NeverEqual;

impl<T> MutationPolicy<T> for NeverEqual {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

struct MutableStateInner<T> {
    id: StateId,
    system: Rc<SnapshotSystem>,
    value: RefCell<T>,
    version: Cell<u64>,
    policy: Rc<dyn MutationPolicy<T>>,
}

impl<T: 'static> StateObject for MutableStateInner<T> {
    fn state_id(&self) -> StateId {
        self.id
    }

    fn version(&self) -> u64 {
        self.version.get()
    }
}

impl<T: Clone + 'static> Commit for MutableStateInner<T> {
    fn commit(&self, value: Rc<dyn Any>) {
        if let Ok(value) = value.downcast::<T>() {
            *self.value.borrow_mut() = (*value).clone();
            self.version.set(self.version.get() + 1);
        }
    }
}

/// Observable mutable value. Clones share the same state object.
pub struct MutableState<T> {
    inner: Rc<MutableStateInner<T>>,
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> PartialEq for MutableState<T> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Eq for MutableState<T> {}

impl<T: fmt::Debug> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}

impl<T: Clone + 'static> MutableState<T> {
    pub(crate) fn new(system: Rc<SnapshotSystem>, value: T, policy: Rc<dyn MutationPolicy<T>>) -> Self {
        Self {
            inner: Rc::new(MutableStateInner {
                id: StateId::next(),
                system,
                value: RefCell::new(value),
                version: Cell::new(0),
                policy,
            }),
        }
    }

    pub fn id(&self) -> StateId {
        self.inner.id
    }

    pub fn as_state_ref(&self) -> StateRef {
        self.inner.clone()
    }

    fn visible(&self) -> T {
        match self.inner.system.isolated_value(self.inner.id) {
            Some(value) => match value.downcast::<T>() {
                Ok(value) => (*value).clone(),
                Err(_) => self.inner.value.borrow().clone(),
            },
            None => self.inner.value.borrow().clone(),
        }
    }

    /// Reads the value, reporting the read to the active observer.
    pub fn get(&self) -> T {
        self.inner.system.report_read(&self.as_state_ref());
        self.visible()
    }

    /// Reads the value without reporting the read.
    pub fn peek(&self) -> T {
        self.visible()
    }

    /// The last committed value, ignoring buffered writes.
    pub fn committed(&self) -> T {
        self.inner.value.borrow().clone()
    }

    pub fn set(&self, value: T) {
        let current = self.visible();
        if self.inner.policy.equivalent(&current, &value) {
            return;
        }
        let target: Rc<dyn Commit> = self.inner.clone();
        self.inner
            .system
            .write(self.as_state_ref(), target, Rc::new(value));
    }

    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut value = self.visible();
        f(&mut value);
        self.set(value);
    }
}

struct DerivedCache<T> {
    value: T,
    dependencies: Vec<(StateRef, u64)>,
}

struct DerivedStateInner<T> {
    id: StateId,
    system: Rc<SnapshotSystem>,
    compute: Rc<dyn Fn() -> T>,
    policy: Rc<dyn MutationPolicy<T>>,
    cache: RefCell<Option<DerivedCache<T>>>,
    revision: Cell<u64>,
}

impl<T: Clone + 'static> DerivedStateInner<T> {
    fn is_stale(&self, cache: &DerivedCache<T>) -> bool {
        cache
            .dependencies
            .iter()
            .any(|(dependency, seen)| dependency.version() != *seen)
    }

    fn depends_on_isolated_write(&self, cache: &DerivedCache<T>) -> bool {
        cache
            .dependencies
            .iter()
            .any(|(dependency, _)| self.system.has_isolated_write(dependency.state_id()))
    }

    fn calculate(&self) -> (T, Vec<StateRef>) {
        let reads: Rc<RefCell<Vec<StateRef>>> = Rc::default();
        let sink = reads.clone();
        let value = self.system.collect_reads(
            Rc::new(move |state: &StateRef| {
                let mut reads = sink.borrow_mut();
                if reads.iter().any(|held| held.state_id() == state.state_id()) {
                    return false;
                }
                reads.push(state.clone());
                true
            }),
            || (self.compute)(),
        );
        let dependencies = reads.take();
        (value, dependencies)
    }

    /// Returns the current value, recalculating when a dependency moved.
    fn current(&self) -> T {
        let cached = {
            let cache = self.cache.borrow();
            match cache.as_ref() {
                Some(cache) if self.depends_on_isolated_write(cache) => None,
                Some(cache) if !self.is_stale(cache) => Some(cache.value.clone()),
                _ => None,
            }
        };
        if let Some(value) = cached {
            return value;
        }
        let (value, dependencies) = self.calculate();
        if dependencies
            .iter()
            .any(|dependency| self.system.has_isolated_write(dependency.state_id()))
        {
            // Buffered inputs: the result is not committed state yet.
            return value;
        }
        let mut cache = self.cache.borrow_mut();
        let changed = match cache.as_ref() {
            Some(previous) => !self.policy.equivalent(&previous.value, &value),
            None => true,
        };
        if changed {
            self.revision.set(self.revision.get() + 1);
        }
        let dependencies = dependencies
            .into_iter()
            .map(|dependency| {
                let version = dependency.version();
                (dependency, version)
            })
            .collect();
        *cache = Some(DerivedCache {
            value: value.clone(),
            dependencies,
        });
        value
    }
}

impl<T: Clone + 'static> StateObject for DerivedStateInner<T> {
    fn state_id(&self) -> StateId {
        self.id
    }

    fn version(&self) -> u64 {
        self.current_revision()
    }

    fn as_derived(&self) -> Option<&dyn DerivedStateObject> {
        Some(self)
    }
}

impl<T: Clone + 'static> DerivedStateObject for DerivedStateInner<T> {
    fn dependencies(&self) -> Vec<StateRef> {
        self.cache
            .borrow()
            .as_ref()
            .map(|cache| {
                cache
                    .dependencies
                    .iter()
                    .map(|(dependency, _)| dependency.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn current_revision(&self) -> u64 {
        self.current();
        self.revision.get()
    }
}

/// Memoized calculation over other state objects. Observers of a derived
/// state are only invalidated when the calculated value changes.
pub struct DerivedState<T> {
    inner: Rc<DerivedStateInner<T>>,
}

impl<T> Clone for DerivedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> DerivedState<T> {
    pub(crate) fn new(system: Rc<SnapshotSystem>, compute: Rc<dyn Fn() -> T>, policy: Rc<dyn MutationPolicy<T>>) -> Self {
        Self {
            inner: Rc::new(DerivedStateInner {
                id: StateId::next(),
                system,
                compute,
                policy,
                cache: RefCell::new(None),
                revision: Cell::new(0),
            }),
        }
    }

    pub fn id(&self) -> StateId {
        self.inner.id
    }

    pub fn as_state_ref(&self) -> StateRef {
        self.inner.clone()
    }

    pub fn get(&self) -> T {
        let value = self.inner.current();
        self.inner.system.report_read(&self.as_state_ref());
        value
    }

    pub fn revision(&self) -> u64 {
        self.inner.current_revision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DataSourceRegistry;

    #[test]
    fn derived_state_recalculates_only_when_inputs_change() {
        let system = SnapshotSystem::new();
        let input = system.mutable_state_of(2);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let source = input.clone();
        let parity = system.derived_state_of(move || {
            counter.set(counter.get() + 1);
            source.get() % 2
        });

        assert_eq!(parity.get(), 0);
        assert_eq!(parity.get(), 0);
        assert_eq!(calls.get(), 1);
        let first = parity.revision();

        input.set(4);
        assert_eq!(parity.get(), 0);
        assert_eq!(calls.get(), 2);
        assert_eq!(parity.revision(), first);

        input.set(5);
        assert_eq!(parity.get(), 1);
        assert_eq!(parity.revision(), first + 1);
    }

    #[test]
    fn derived_reads_are_reported_as_the_derived_object() {
        let registry = DataSourceRegistry::new();
        let (system, _handle) = SnapshotSystem::install(&registry);
        let input = system.mutable_state_of(1);
        let source = input.clone();
        let doubled = system.derived_state_of(move || source.get() * 2);
        let reads = Rc::new(RefCell::new(Vec::new()));
        let sink = reads.clone();
        registry.observe(
            Rc::new(move |state: &StateRef| {
                sink.borrow_mut().push(state.state_id());
                true
            }),
            || assert_eq!(doubled.get(), 2),
        );
        assert_eq!(*reads.borrow(), vec![doubled.id()]);
        let dependencies: Vec<_> = doubled
            .as_state_ref()
            .as_derived()
            .map(|derived| derived.dependencies().iter().map(|d| d.state_id()).collect())
            .unwrap_or_default();
        assert_eq!(dependencies, vec![input.id()]);
    }

    #[test]
    fn equal_writes_are_ignored_by_structural_policy() {
        let system = SnapshotSystem::new();
        let state = system.mutable_state_of(1);
        let before = state.as_state_ref().version();
        state.set(1);
        assert_eq!(state.as_state_ref().version(), before);
        let always = system.mutable_state_with_policy(1, Rc::new(NeverEqual));
        always.set(1);
        assert_eq!(always.as_state_ref().version(), 1);
    }
}
