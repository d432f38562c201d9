use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::collections::map::HashMap;
use crate::composer::Composer;
use crate::slot_table::Anchor;
use crate::snapshot::{StateId, StateRef};

pub type ScopeId = usize;

static NEXT_SCOPE_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn next_scope_id() -> ScopeId {
    NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Re-runs the composable call that created a scope.
pub type ScopeBlock = Rc<dyn Fn(&mut Composer<'_>)>;

/// Outcome of invalidating a recompose scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationResult {
    /// The scope is no longer part of a live composition.
    Ignored,
    /// The scope will be recomposed by the pass already in progress.
    Imminent,
    /// A new pass is needed and has been requested from the parent context.
    Scheduled,
    /// A pass is in progress but has already passed the scope; it is picked
    /// up by the next pass.
    Deferred,
}

/// The composition a scope currently belongs to.
pub(crate) trait RecomposeScopeOwner {
    fn invalidate(&self, scope: &RecomposeScope, instance: Option<StateId>) -> InvalidationResult;
    fn recompose_scope_released(&self, scope: &RecomposeScope);
}

struct TrackedDerived {
    state: StateRef,
    revision: u64,
    token: u64,
}

struct RecomposeScopeInner {
    id: ScopeId,
    owner: RefCell<Option<Weak<dyn RecomposeScopeOwner>>>, // FUTURE(no_std): replace Weak with arena handle.
    anchor: RefCell<Option<Anchor>>,
    block: RefCell<Option<ScopeBlock>>,
    invalid: Cell<bool>,
    released: Cell<bool>,
    token: Cell<u64>,
    tracked: RefCell<HashMap<StateId, u64>>,
    tracked_derived: RefCell<HashMap<StateId, TrackedDerived>>,
}

/// One independently re-executable unit of composition.
///
/// A scope is created by a restart group and lives in that group's slots.
/// It remembers the values read during its last execution and is
/// released when its group leaves the slot table.
#[derive(Clone)]
pub struct RecomposeScope {
    inner: Rc<RecomposeScopeInner>, // FUTURE(no_std): replace Rc with arena-managed scope handles.
}

impl PartialEq for RecomposeScope {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for RecomposeScope {}

impl fmt::Debug for RecomposeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomposeScope")
            .field("id", &self.inner.id)
            .field("invalid", &self.inner.invalid.get())
            .field("released", &self.inner.released.get())
            .finish()
    }
}

impl RecomposeScope {
    pub(crate) fn new(owner: Weak<dyn RecomposeScopeOwner>) -> Self {
        Self {
            inner: Rc::new(RecomposeScopeInner {
                id: next_scope_id(),
                owner: RefCell::new(Some(owner)),
                anchor: RefCell::new(None),
                block: RefCell::new(None),
                invalid: Cell::new(false),
                released: Cell::new(false),
                token: Cell::new(0),
                tracked: RefCell::new(HashMap::default()),
                tracked_derived: RefCell::new(HashMap::default()),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// True while the scope's group is part of a slot table.
    pub fn is_valid(&self) -> bool {
        !self.inner.released.get()
            && self.owner().is_some()
            && self
                .inner
                .anchor
                .borrow()
                .as_ref()
                .is_some_and(Anchor::valid)
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.invalid.get()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.get()
    }

    /// A conditional scope read at least one derived state, so some of its
    /// invalidations can be retracted when the derived value is unchanged.
    pub fn is_conditional(&self) -> bool {
        !self.inner.tracked_derived.borrow().is_empty()
    }

    /// Requests recomposition of this scope from the composition that owns it.
    pub fn invalidate(&self) -> InvalidationResult {
        self.invalidate_for(None)
    }

    pub(crate) fn invalidate_for(&self, instance: Option<StateId>) -> InvalidationResult {
        match self.owner() {
            Some(owner) => owner.invalidate(self, instance),
            None => InvalidationResult::Ignored,
        }
    }

    pub(crate) fn owner(&self) -> Option<Rc<dyn RecomposeScopeOwner>> {
        self.inner.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn is_owned_by(&self, owner: &Rc<dyn RecomposeScopeOwner>) -> bool {
        self.owner()
            .is_some_and(|held| std::ptr::addr_eq(Rc::as_ptr(&held), Rc::as_ptr(owner)))
    }

    pub(crate) fn adopt(&self, owner: Weak<dyn RecomposeScopeOwner>) {
        *self.inner.owner.borrow_mut() = Some(owner);
    }

    pub(crate) fn anchor(&self) -> Option<Anchor> {
        self.inner.anchor.borrow().clone()
    }

    pub(crate) fn set_anchor(&self, anchor: Anchor) {
        *self.inner.anchor.borrow_mut() = Some(anchor);
    }

    pub(crate) fn block(&self) -> Option<ScopeBlock> {
        self.inner.block.borrow().clone()
    }

    pub(crate) fn set_block(&self, block: ScopeBlock) {
        *self.inner.block.borrow_mut() = Some(block);
    }

    pub(crate) fn mark_invalid(&self) {
        self.inner.invalid.set(true);
    }

    pub(crate) fn mark_valid(&self) {
        self.inner.invalid.set(false);
    }

    /// Called when the scope's group leaves the slot table for good.
    pub(crate) fn release(&self) {
        if self.inner.released.replace(true) {
            return;
        }
        let owner = self.owner();
        self.inner.anchor.borrow_mut().take();
        self.inner.block.borrow_mut().take();
        self.inner.tracked.borrow_mut().clear();
        self.inner.tracked_derived.borrow_mut().clear();
        if let Some(owner) = owner {
            owner.recompose_scope_released(self);
        }
    }

    /// Begins an execution of the scope. Reads recorded with an older token
    /// are dropped by [`end`](Self::end).
    pub(crate) fn start(&self) {
        self.inner.token.set(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed));
        self.inner.invalid.set(false);
    }

    /// Ends an execution, returning the values the scope no longer reads.
    pub(crate) fn end(&self) -> Vec<StateId> {
        let token = self.inner.token.get();
        let mut stale = Vec::new();
        self.inner.tracked.borrow_mut().retain(|id, seen| {
            if *seen == token {
                return true;
            }
            stale.push(*id);
            false
        });
        self.inner
            .tracked_derived
            .borrow_mut()
            .retain(|_, tracked| tracked.token == token);
        stale
    }

    /// Records a read. Returns `true` the first time `state` is read during
    /// the current execution.
    pub(crate) fn record_read(&self, state: &StateRef) -> bool {
        let token = self.inner.token.get();
        let id = state.state_id();
        let previous = self.inner.tracked.borrow_mut().insert(id, token);
        if previous == Some(token) {
            return false;
        }
        if let Some(derived) = state.as_derived() {
            let revision = derived.current_revision();
            self.inner.tracked_derived.borrow_mut().insert(
                id,
                TrackedDerived {
                    state: state.clone(),
                    revision,
                    token,
                },
            );
        }
        true
    }

    pub(crate) fn tracked_ids(&self) -> Vec<StateId> {
        self.inner.tracked.borrow().keys().copied().collect()
    }

    pub(crate) fn tracked_derived_states(&self) -> Vec<StateRef> {
        self.inner
            .tracked_derived
            .borrow()
            .values()
            .map(|tracked| tracked.state.clone())
            .collect()
    }

    /// Whether an invalidation caused by `instances` still stands. It is
    /// retracted when every instance is a derived state this scope read whose
    /// value has not changed since.
    pub(crate) fn is_invalid_for(&self, instances: Option<&[StateId]>) -> bool {
        let Some(instances) = instances else {
            return true;
        };
        if instances.is_empty() {
            return true;
        }
        let tracked: Vec<(StateRef, u64)> = {
            let derived = self.inner.tracked_derived.borrow();
            let mut found = Vec::with_capacity(instances.len());
            for id in instances {
                match derived.get(id) {
                    Some(tracked) => found.push((tracked.state.clone(), tracked.revision)),
                    None => return true,
                }
            }
            found
        };
        tracked.iter().any(|(state, revision)| {
            state
                .as_derived()
                .map_or(true, |derived| derived.current_revision() != *revision)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot_table::{GroupKind, GroupRecord, SlotTable};
    use crate::snapshot::SnapshotSystem;

    struct CountingOwner {
        released: Cell<usize>,
    }

    impl RecomposeScopeOwner for CountingOwner {
        fn invalidate(&self, _scope: &RecomposeScope, _instance: Option<StateId>) -> InvalidationResult {
            InvalidationResult::Scheduled
        }

        fn recompose_scope_released(&self, _scope: &RecomposeScope) {
            self.released.set(self.released.get() + 1);
        }
    }

    fn owned_scope() -> (Rc<CountingOwner>, RecomposeScope) {
        let owner = Rc::new(CountingOwner { released: Cell::new(0) });
        let dyn_owner: Rc<dyn RecomposeScopeOwner> = owner.clone();
        let scope = RecomposeScope::new(Rc::downgrade(&dyn_owner));
        (owner, scope)
    }

    #[test]
    fn reads_from_a_previous_execution_become_stale() {
        let system = SnapshotSystem::new();
        let a = system.mutable_state_of(1);
        let b = system.mutable_state_of(2);
        let (_owner, scope) = owned_scope();

        scope.start();
        assert!(scope.record_read(&a.as_state_ref()));
        assert!(!scope.record_read(&a.as_state_ref()));
        assert!(scope.record_read(&b.as_state_ref()));
        assert!(scope.end().is_empty());

        scope.start();
        scope.record_read(&b.as_state_ref());
        assert_eq!(scope.end(), vec![a.id()]);
        assert_eq!(scope.tracked_ids(), vec![b.id()]);
    }

    #[test]
    fn unchanged_derived_value_retracts_invalidation() {
        let system = SnapshotSystem::new();
        let input = system.mutable_state_of(2);
        let source = input.clone();
        let even = system.derived_state_of(move || source.get() % 2 == 0);
        let (_owner, scope) = owned_scope();

        scope.start();
        even.get();
        scope.record_read(&even.as_state_ref());
        scope.end();
        assert!(scope.is_conditional());

        input.set(4);
        assert!(!scope.is_invalid_for(Some(&[even.id()])));
        input.set(5);
        assert!(scope.is_invalid_for(Some(&[even.id()])));
        assert!(scope.is_invalid_for(Some(&[input.id()])));
        assert!(scope.is_invalid_for(None));
    }

    #[test]
    fn release_is_reported_once() {
        let (owner, scope) = owned_scope();
        let mut table = SlotTable::with_root();
        let anchor = table.write(|writer| {
            let index = writer.insert_records(0, 0, vec![GroupRecord::new(1, None, GroupKind::Restart)]);
            writer.anchor(index)
        });
        scope.set_anchor(anchor);
        assert!(scope.is_valid());
        scope.release();
        scope.release();
        assert_eq!(owner.released.get(), 1);
        assert!(!scope.is_valid());
    }
}
