//! A composition owns one slot table and coordinates the passes that keep it
//! and the applier's tree in line with the content.
//!
//! Everything a composition does happens under its busy flag: composing,
//! recomposing, inserting movable content, applying changes and disposing.
//! Re-entering any of these from inside another is a programming error.
//! Modifications of observed state may arrive at any time, from any thread,
//! through [`ModificationRecorder`]; they are merged at the next safe point.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::applier::{Applier, NodeId};
use crate::change_list::{forget_records, ApplyContext, ApplyReport, Change, ChangeList, MovableFill};
use crate::collections::map::{HashMap, HashSet};
use crate::collections::ScopeMap;
use crate::composer::{Composer, ComposerConfig, ComposerState, Content, Invalidations};
use crate::error::ComposeError;
use crate::movable_content::{MovableContentState, MovableContentStateReference};
use crate::pending::{ModificationRecorder, ModifiedSet, PendingSlot};
use crate::recompose_scope::{InvalidationResult, RecomposeScope, RecomposeScopeOwner};
use crate::remember::{RememberEventDispatcher, RememberManager, SharedAbandonSet};
use crate::slot_table::{Anchor, GroupKind, Key, Slot, SlotTable};
use crate::snapshot::{DataSourceRegistry, ObserverHandle, RecordChange, RecordDependency, StateId, StateRef};

pub type CompositionId = usize;

static NEXT_COMPOSITION_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompositionState {
    Active,
    /// Applying changes failed. Only [`Composition::dispose`] is allowed.
    Damaged,
    Disposed,
}

/// Instrumentation hook notified around every pass.
pub trait CompositionObserver {
    fn on_begin_composition(&self, composition: CompositionId, invalidations: &[RecomposeScope]);
    fn on_end_composition(&self, composition: CompositionId);
}

/// The parent of a composition: schedules its passes and pairs movable
/// content across the compositions it manages.
pub trait CompositionContext {
    fn data_sources(&self) -> DataSourceRegistry;
    /// Composes `content` into `composition` for the first time and applies
    /// the result.
    fn compose_initial(&self, composition: &Rc<dyn ControlledComposition>, content: Content) -> Result<(), ComposeError>;
    /// `composition` has invalidations and needs a pass.
    fn invalidate(&self, composition: CompositionId);
    fn register_composition(&self, composition: &Rc<dyn ControlledComposition>);
    fn unregister_composition(&self, composition: CompositionId);
    fn insert_movable_content(&self, reference: MovableContentStateReference);
    fn delete_movable_content(&self, reference: MovableContentStateReference);
    /// Extracted state is now available to be claimed.
    fn movable_content_state_released(&self, reference: MovableContentStateReference);
    /// Claims the extracted state of `reference`.
    fn movable_content_state_resolve(&self, reference: &MovableContentStateReference) -> Option<MovableContentState>;
    fn observer(&self) -> Option<Rc<dyn CompositionObserver>> {
        None
    }
}

/// The side of a composition its parent context drives.
pub trait ControlledComposition {
    fn id(&self) -> CompositionId;
    fn compose_content(&self, content: Content);
    /// Recomposes the invalidated scopes. Returns `false` without a pass
    /// when nothing is invalid.
    fn recompose(&self) -> bool;
    fn insert_movable_content(&self, references: Vec<(MovableContentStateReference, Option<MovableContentStateReference>)>);
    fn apply_changes(&self) -> Result<(), ComposeError>;
    fn apply_late_changes(&self) -> Result<(), ComposeError>;
    fn changes_applied(&self);
    fn record_modifications_of(&self, values: &HashSet<StateId>);
    fn has_invalidations(&self) -> bool;
    fn has_pending_changes(&self) -> bool;
    fn is_composing(&self) -> bool;
    fn is_disposed(&self) -> bool;
    fn state(&self) -> CompositionState;
    fn dispose_unused_movable_content(&self, state: MovableContentState);
    /// Runs `block` with invalidations of scopes inside `group` redirected
    /// to `to`.
    fn delegate_invalidations(&self, to: Option<Rc<dyn ControlledComposition>>, group: Anchor, block: &mut dyn FnMut());
    /// Accepts an invalidation redirected from another composition.
    fn invalidate_delegated(&self, scope: &RecomposeScope, instance: Option<StateId>) -> InvalidationResult;
}

/// Observation key for a derived state, equal by state id.
#[derive(Clone)]
struct DerivedRef(StateRef);

impl PartialEq for DerivedRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.state_id() == other.0.state_id()
    }
}

struct Busy<'a>(&'a Cell<bool>);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Abandons a pass that unwinds out of user code.
struct PassGuard<'a, A: Applier + 'static> {
    inner: &'a CompositionInner<A>,
    armed: bool,
}

impl<A: Applier + 'static> Drop for PassGuard<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon_pass();
        }
    }
}

/// Marks the composition damaged unless the replay completes.
struct DamageGuard<'a, A: Applier + 'static> {
    inner: &'a CompositionInner<A>,
    armed: bool,
}

impl<A: Applier + 'static> Drop for DamageGuard<'_, A> {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("composition {} damaged while applying changes", self.inner.id);
            self.inner.state.set(CompositionState::Damaged);
            self.inner.late_changes.borrow_mut().clear();
            let abandoned: Vec<usize> = self.inner.abandon_set.borrow().identities().collect();
            self.inner.abandoned.borrow_mut().extend(abandoned);
            RememberEventDispatcher::new(self.inner.abandon_set.clone()).dispatch_abandons();
        }
    }
}

struct CompositionInner<A: Applier + 'static> {
    id: CompositionId,
    this: Weak<CompositionInner<A>>,
    parent: Rc<dyn CompositionContext>,
    slot_table: RefCell<SlotTable>,
    changes: RefCell<ChangeList>,
    late_changes: RefCell<ChangeList>,
    applier: RefCell<A>,
    /// Node children as last synchronized with the applier.
    children: RefCell<HashMap<NodeId, Vec<NodeId>>>,
    observations: RefCell<ScopeMap<StateId, RecomposeScope>>,
    observations_processed: RefCell<ScopeMap<StateId, RecomposeScope>>,
    /// Upstream dependency -> derived states observed by some scope.
    derived_states: RefCell<ScopeMap<StateId, DerivedRef>>,
    conditionally_invalidated: RefCell<Vec<RecomposeScope>>,
    invalidations: RefCell<Invalidations>,
    composer_state: ComposerState,
    abandon_set: SharedAbandonSet,
    /// Objects abandoned by a failed apply that may still sit in the table.
    abandoned: RefCell<HashSet<usize>>,
    pending: PendingSlot,
    /// A pass ran and its changes have not been applied.
    composed: Cell<bool>,
    state: Cell<CompositionState>,
    busy: Cell<bool>,
    reusing: Cell<bool>,
    delegate: RefCell<Option<(Rc<dyn ControlledComposition>, Anchor)>>,
    observers: RefCell<Vec<(u64, Rc<dyn CompositionObserver>)>>,
    next_observer: Cell<u64>,
}

impl<A: Applier + 'static> CompositionInner<A> {
    fn lock(&self) -> Busy<'_> {
        if self.busy.replace(true) {
            panic!("composition {} is already busy; re-entrant composition is not supported", self.id);
        }
        Busy(&self.busy)
    }

    fn check_composable(&self) {
        match self.state.get() {
            CompositionState::Active => {}
            CompositionState::Damaged => panic!("composition {} is damaged and must be disposed", self.id),
            CompositionState::Disposed => panic!("composition {} is disposed", self.id),
        }
    }

    fn check_applicable(&self) -> Result<(), ComposeError> {
        match self.state.get() {
            CompositionState::Active => Ok(()),
            CompositionState::Damaged => Err(ComposeError::Damaged),
            CompositionState::Disposed => Err(ComposeError::Disposed),
        }
    }

    fn list(&self, late: bool) -> &RefCell<ChangeList> {
        if late {
            &self.late_changes
        } else {
            &self.changes
        }
    }

    fn observers(&self) -> Vec<Rc<dyn CompositionObserver>> {
        let mut observers: Vec<_> = self
            .observers
            .borrow()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        observers.extend(self.parent.observer());
        observers
    }

    // ── observation ─────────────────────────────────────────────────────

    fn record_read_of(&self, state: &StateRef) -> bool {
        let Some(scope) = self.composer_state.current_scope() else {
            return false;
        };
        if !scope.record_read(state) {
            return false;
        }
        self.observations
            .borrow_mut()
            .add(state.state_id(), scope);
        if state.as_derived().is_some() {
            self.record_derived_dependencies(state);
        }
        true
    }

    /// Registers every upstream dependency of `derived`, nested derived
    /// states flattened.
    fn record_derived_dependencies(&self, derived: &StateRef) {
        let Some(object) = derived.as_derived() else {
            return;
        };
        let handle = DerivedRef(derived.clone());
        let mut map = self.derived_states.borrow_mut();
        map.remove_scope(&handle);
        let mut seen: HashSet<StateId> = HashSet::default();
        let mut stack = object.dependencies();
        while let Some(dependency) = stack.pop() {
            if !seen.insert(dependency.state_id()) {
                continue;
            }
            map.add(dependency.state_id(), handle.clone());
            if let Some(nested) = dependency.as_derived() {
                stack.extend(nested.dependencies());
            }
        }
    }

    /// A write made by the pass itself. Scopes still ahead of the traversal
    /// are invalidated right away and remembered, so the notification that
    /// follows the pass does not invalidate them a second time.
    fn record_write_of(&self, state: &StateRef) {
        let id = state.state_id();
        self.invalidate_imminent(id);
        let dependents = self.derived_states.borrow().scopes_of(&id);
        for derived in dependents {
            self.invalidate_imminent(derived.0.state_id());
        }
    }

    fn invalidate_imminent(&self, id: StateId) {
        let scopes = self.observations.borrow().scopes_of(&id);
        for scope in scopes {
            if scope.invalidate_for(Some(id)) == InvalidationResult::Imminent {
                self.observations_processed
                    .borrow_mut()
                    .add(id, scope);
            }
        }
    }

    fn add_pending_invalidations(&self, sets: Vec<ModifiedSet>, forget_conditional: bool) {
        if sets.is_empty() {
            return;
        }
        let mut invalidated: Vec<RecomposeScope> = Vec::new();
        let mut invalidate = |id: StateId| {
            let scopes = self.observations.borrow().scopes_of(&id);
            for scope in scopes {
                if self.observations_processed.borrow_mut().remove(&id, &scope) {
                    continue;
                }
                if scope.invalidate_for(Some(id)) == InvalidationResult::Ignored {
                    continue;
                }
                if scope.is_conditional() && !forget_conditional {
                    self.conditionally_invalidated.borrow_mut().push(scope);
                } else {
                    invalidated.push(scope);
                }
            }
        };
        for set in &sets {
            for id in set.iter() {
                invalidate(*id);
                let dependents = self.derived_states.borrow().scopes_of(id);
                for derived in dependents {
                    invalidate(derived.0.state_id());
                }
            }
        }
        let conditional = if forget_conditional {
            std::mem::take(&mut *self.conditionally_invalidated.borrow_mut())
        } else {
            Vec::new()
        };
        if invalidated.is_empty() && conditional.is_empty() {
            return;
        }
        self.observations
            .borrow_mut()
            .remove_scope_if(|scope| invalidated.contains(scope) || conditional.contains(scope));
        self.clean_derived_states();
    }

    fn clean_derived_states(&self) {
        let observations = self.observations.borrow();
        self.derived_states
            .borrow_mut()
            .remove_scope_if(|derived| !observations.contains(&derived.0.state_id()));
    }

    /// Retracts invalidations caused only by derived states whose value did
    /// not change.
    fn filter_invalidations(&self) {
        let mut retracted = Vec::new();
        self.invalidations.borrow_mut().retain(|entry| {
            if entry.scope.is_released() {
                return false;
            }
            let stands = entry.scope.is_invalid_for(entry.instances.as_deref());
            if !stands {
                log::trace!("retracting conditional invalidation of scope {}", entry.scope.id());
                entry.scope.mark_valid();
                retracted.push(entry.scope.clone());
            }
            stands
        });
        // A retracted scope will not run, so its reads from the last run
        // are observed again.
        for scope in &retracted {
            self.reread_tracked(scope);
        }
    }

    fn reread_tracked(&self, scope: &RecomposeScope) {
        {
            let mut observations = self.observations.borrow_mut();
            for id in scope.tracked_ids() {
                observations.add(id, scope.clone());
            }
        }
        for derived in scope.tracked_derived_states() {
            self.record_derived_dependencies(&derived);
        }
    }

    fn drain_after_apply(&self) {
        let sets = self.pending.drain();
        self.add_pending_invalidations(sets, false);
        self.observations_processed.borrow_mut().clear();
    }

    // ── passes ──────────────────────────────────────────────────────────

    fn begin_pass(&self) {
        let scopes: Vec<RecomposeScope> = self
            .invalidations
            .borrow()
            .iter()
            .map(|entry| entry.scope.clone())
            .collect();
        log::debug!("composition {} composing with {} invalidation(s)", self.id, scopes.len());
        for observer in self.observers() {
            observer.on_begin_composition(self.id, &scopes);
        }
        let pending = self.invalidations.borrow_mut().take();
        let mut in_pass = self.composer_state.invalidations.borrow_mut();
        for entry in pending {
            in_pass.merge(entry);
        }
    }

    fn end_pass(&self) {
        self.composer_state.invalidations.borrow_mut().clear();
        self.composed.set(true);
        for observer in self.observers() {
            observer.on_end_composition(self.id);
        }
        log::debug!(
            "composition {} composed; {} change(s) pending",
            self.id,
            self.changes.borrow().len()
        );
    }

    /// Runs a composer inside an observation of reads and an isolation of
    /// writes. Changes are recorded into the late list when `late` is set.
    fn with_composer<R>(&self, late: bool, run: impl FnOnce(&mut Composer<'_>) -> R) -> R {
        let mut guard = PassGuard { inner: self, armed: true };
        let registry = self.parent.data_sources();
        let reader = self.this.clone();
        let record_read: RecordDependency =
            Rc::new(move |state: &StateRef| reader.upgrade().is_some_and(|inner| inner.record_read_of(state)));
        let writer = self.this.clone();
        let record_write: RecordChange = Rc::new(move |state: &StateRef| {
            if let Some(inner) = writer.upgrade() {
                inner.record_write_of(state);
            }
        });
        let root_node = self.applier.borrow().root();
        let result = registry.observe(record_read, || {
            registry.isolate(Some(record_write), || {
                let table = self.slot_table.borrow();
                let mut changes = self.list(late).borrow_mut();
                let mut composer = Composer::new(ComposerConfig {
                    reader: table.open_reader(),
                    state: &self.composer_state,
                    changes: &mut changes,
                    abandon: self.abandon_set.clone(),
                    parent: self.parent.clone(),
                    owner: self.this.clone(),
                    composition: self.this.clone(),
                    composition_id: self.id,
                    root_node,
                    reusing: self.reusing.get(),
                });
                run(&mut composer)
            })
        });
        guard.armed = false;
        let stale = self.composer_state.take_stale_reads();
        if !stale.is_empty() {
            let mut observations = self.observations.borrow_mut();
            for (id, scope) in stale {
                observations.remove(&id, &scope);
            }
        }
        self.clean_derived_states();
        result
    }

    fn abandon_pass(&self) {
        log::debug!("composition {} abandoned a pass", self.id);
        let leftover = self.composer_state.invalidations.borrow_mut().take();
        {
            let mut invalidations = self.invalidations.borrow_mut();
            for entry in leftover {
                invalidations.merge(entry);
            }
        }
        self.composer_state.reset();
        self.changes.borrow_mut().clear();
        self.late_changes.borrow_mut().clear();
        self.composed.set(false);
        self.pending.abandon_pass();
        RememberEventDispatcher::new(self.abandon_set.clone()).dispatch_abandons();
    }

    fn compose_content(&self, content: Content) {
        self.check_composable();
        let _busy = self.lock();
        let sets = self.pending.drain_for_composition();
        self.add_pending_invalidations(sets, true);
        self.filter_invalidations();
        self.begin_pass();
        self.with_composer(false, |composer| composer.compose_root(content));
        self.end_pass();
    }

    fn recompose(&self) -> bool {
        self.check_composable();
        let _busy = self.lock();
        let sets = self.pending.drain_for_composition();
        self.add_pending_invalidations(sets, true);
        self.filter_invalidations();
        if self.invalidations.borrow().is_empty() {
            let sets = self.pending.drain();
            self.add_pending_invalidations(sets, false);
            return false;
        }
        self.begin_pass();
        self.with_composer(false, |composer| composer.recompose_invalidated());
        self.end_pass();
        true
    }

    fn insert_movable_content(&self, references: Vec<(MovableContentStateReference, Option<MovableContentStateReference>)>) {
        self.check_composable();
        let _busy = self.lock();
        for (to, from) in references {
            let fill = match from {
                Some(from) => MovableFill::Moved(from),
                None => {
                    let content = to.content.clone();
                    MovableFill::Fresh(self.with_composer(true, |composer| composer.compose_movable(&content)))
                }
            };
            self.late_changes.borrow_mut().push(Change::FillMovable {
                placeholder: to.anchor.clone(),
                fill,
            });
        }
    }

    // ── apply ───────────────────────────────────────────────────────────

    fn apply_list(&self, late: bool) -> Result<(), ComposeError> {
        let mut list = std::mem::take(&mut *self.list(late).borrow_mut());
        let mut manager = RememberEventDispatcher::new(self.abandon_set.clone());
        let mut guard = DamageGuard { inner: self, armed: true };
        let parent = self.parent.clone();
        let resolve = move |reference: &MovableContentStateReference| parent.movable_content_state_resolve(reference);
        let report = {
            let mut applier = self.applier.borrow_mut();
            applier.on_begin_changes();
            let root_node = applier.root();
            let result = {
                let mut table = self.slot_table.borrow_mut();
                let mut children = self.children.borrow_mut();
                list.execute_and_flush_all_pending_changes(ApplyContext {
                    applier: &mut *applier,
                    table: &mut table,
                    manager: &mut manager,
                    children: &mut children,
                    root_node,
                    resolve: &resolve,
                })
            };
            applier.on_end_changes();
            result?
        };
        self.process_report(report);
        manager.dispatch_remember_observers(&mut *self.applier.borrow_mut())?;
        manager.dispatch_side_effects();
        if late || self.late_changes.borrow().is_empty() {
            manager.dispatch_abandons();
        }
        guard.armed = false;
        log::debug!("composition {} applied {}changes", self.id, if late { "late " } else { "" });
        Ok(())
    }

    fn process_report(&self, report: ApplyReport) {
        let ApplyReport {
            released,
            adopted,
            extracted,
        } = report;
        for scope in released {
            scope.release();
        }
        let owner: Weak<dyn RecomposeScopeOwner> = self.this.clone();
        for scope in adopted {
            scope.adopt(owner.clone());
            self.reread_tracked(&scope);
            if scope.is_invalid() {
                self.invalidations.borrow_mut().add(&scope, None);
                self.parent.invalidate(self.id);
            }
        }
        for reference in extracted {
            self.parent.movable_content_state_released(reference);
        }
    }

    fn apply_changes(&self) -> Result<(), ComposeError> {
        self.check_applicable()?;
        let _busy = self.lock();
        let result = self.apply_list(false);
        if self.composed.replace(false) {
            self.drain_after_apply();
        }
        result
    }

    fn apply_late_changes(&self) -> Result<(), ComposeError> {
        self.check_applicable()?;
        if self.late_changes.borrow().is_empty() {
            return Ok(());
        }
        let _busy = self.lock();
        self.apply_list(true)
    }

    fn changes_applied(&self) {
        if self.state.get() == CompositionState::Disposed {
            return;
        }
        let _busy = self.lock();
        if let Some(me) = self.this.upgrade() {
            let me: Rc<dyn RecomposeScopeOwner> = me;
            self.observations
                .borrow_mut()
                .remove_scope_if(|scope| scope.is_released() || !scope.is_owned_by(&me));
        }
        self.clean_derived_states();
        {
            let table = self.slot_table.borrow();
            self.invalidations.borrow_mut().retain(|entry| {
                let owned = entry
                    .scope
                    .anchor()
                    .is_some_and(|anchor| table.owns_anchor(&anchor));
                if !owned {
                    log::warn!("dropping invalidation of scope {} with a stale anchor", entry.scope.id());
                }
                owned
            });
        }
        RememberEventDispatcher::new(self.abandon_set.clone()).dispatch_abandons();
    }

    // ── invalidation ────────────────────────────────────────────────────

    fn invalidate_scope(&self, scope: &RecomposeScope, instance: Option<StateId>) -> InvalidationResult {
        if scope.is_released() || scope.block().is_none() {
            return InvalidationResult::Ignored;
        }
        let Some(anchor) = scope.anchor() else {
            return InvalidationResult::Ignored;
        };
        if !anchor.valid() {
            return InvalidationResult::Ignored;
        }
        let delegate = self.delegate.borrow().clone();
        if let Ok(table) = self.slot_table.try_borrow() {
            if !table.owns_anchor(&anchor) {
                drop(table);
                return match delegate {
                    Some((to, _)) => to.invalidate_delegated(scope, instance),
                    None => InvalidationResult::Ignored,
                };
            }
            if let Some((to, group)) = &delegate {
                let inside = group
                    .to_index(&table)
                    .is_some_and(|index| table.group_contains_anchor(index, &anchor));
                if inside {
                    drop(table);
                    return to.invalidate_delegated(scope, instance);
                }
            }
            if let (Some(position), Some(location)) = (self.composer_state.position(), anchor.to_index(&table)) {
                if location >= position {
                    log::trace!("scope {} invalidated ahead of the traversal", scope.id());
                    self.composer_state
                        .invalidations
                        .borrow_mut()
                        .add(scope, instance);
                    scope.mark_invalid();
                    return InvalidationResult::Imminent;
                }
            }
        }
        self.invalidations.borrow_mut().add(scope, instance);
        scope.mark_invalid();
        self.parent.invalidate(self.id);
        if self.composer_state.is_composing() {
            InvalidationResult::Deferred
        } else {
            InvalidationResult::Scheduled
        }
    }

    fn invalidate_all(&self) {
        let scopes: Vec<RecomposeScope> = self
            .slot_table
            .borrow()
            .slots()
            .filter_map(|slot| match slot {
                Slot::Scope(scope) => Some(scope.clone()),
                _ => None,
            })
            .collect();
        for scope in scopes {
            scope.invalidate();
        }
    }

    fn invalidate_groups_with_key(&self, key: Key) {
        let (scopes, whole) = {
            let table = self.slot_table.borrow();
            let mut scopes = Vec::new();
            let mut whole = false;
            for anchor in table.report_groups_with_key(key) {
                let Some(index) = anchor.to_index(&table) else {
                    continue;
                };
                let enclosing = std::iter::once(index)
                    .chain(table.ancestors(index).into_iter().rev())
                    .find_map(|group| table.record(group).scope().cloned());
                match enclosing {
                    Some(scope) => scopes.push(scope),
                    None => whole = true,
                }
            }
            (scopes, whole)
        };
        if whole {
            self.invalidate_all();
            return;
        }
        for scope in scopes {
            scope.invalidate();
        }
    }

    // ── teardown ────────────────────────────────────────────────────────

    fn dispose(&self) {
        if self.state.get() == CompositionState::Disposed {
            return;
        }
        let busy = self.lock();
        log::debug!("disposing composition {}", self.id);
        self.changes.borrow_mut().retain_extractions();
        if !self.changes.borrow().is_empty() {
            if let Err(error) = self.apply_list(false) {
                log::warn!("extracting movable content during dispose failed: {error}");
            }
        }
        self.state.set(CompositionState::Disposed);
        self.late_changes.borrow_mut().clear();
        let mut manager = RememberEventDispatcher::new(self.abandon_set.clone());
        let mut report = ApplyReport::default();
        {
            let mut table = self.slot_table.borrow_mut();
            let records = table.write(|writer| {
                let mut removed = Vec::new();
                while writer.groups_size() > 1 {
                    removed.extend(writer.remove_group_at(1));
                }
                removed
            });
            forget_records(&records, &mut manager, &mut self.children.borrow_mut(), &mut report);
        }
        manager.skip_forgetting(&self.abandoned.borrow());
        for scope in report.released {
            scope.release();
        }
        {
            let mut applier = self.applier.borrow_mut();
            if let Err(error) = manager.dispatch_remember_observers(&mut *applier) {
                log::warn!("releasing nodes of composition {} failed: {error}", self.id);
            }
            applier.clear();
        }
        self.children.borrow_mut().clear();
        self.observations.borrow_mut().clear();
        self.observations_processed.borrow_mut().clear();
        self.derived_states.borrow_mut().clear();
        self.conditionally_invalidated.borrow_mut().clear();
        self.invalidations.borrow_mut().clear();
        manager.dispatch_abandons();
        drop(busy);
        self.parent.unregister_composition(self.id);
    }

    fn deactivate(&self) {
        self.check_composable();
        let _busy = self.lock();
        log::debug!("deactivating composition {}", self.id);
        let mut manager = RememberEventDispatcher::new(self.abandon_set.clone());
        {
            let mut table = self.slot_table.borrow_mut();
            table.write(|writer| {
                for index in 0..writer.groups_size() {
                    // Movable groups keep their content so they can still move.
                    let first = usize::from(writer.record(index).kind == GroupKind::Movable);
                    for slot in writer.slots_mut(index).iter_mut().skip(first) {
                        match slot {
                            Slot::Remembered(holder) => {
                                manager.forgetting(holder.clone());
                                *slot = Slot::Empty;
                            }
                            Slot::Value(_) => *slot = Slot::Empty,
                            Slot::Node(id) => manager.deactivating(*id),
                            Slot::Scope(_) | Slot::Empty => {}
                        }
                    }
                }
            });
        }
        if let Err(error) = manager.dispatch_remember_observers(&mut *self.applier.borrow_mut()) {
            log::warn!("deactivating nodes of composition {} failed: {error}", self.id);
        }
        manager.dispatch_abandons();
        self.observations.borrow_mut().clear();
        self.observations_processed.borrow_mut().clear();
        self.derived_states.borrow_mut().clear();
        self.conditionally_invalidated.borrow_mut().clear();
        self.invalidations.borrow_mut().clear();
    }

    fn dispose_unused_movable_content(&self, mut state: MovableContentState) {
        log::warn!(
            "disposing unclaimed movable content: {} group(s), {} node(s)",
            state.groups_size(),
            state.nodes.len()
        );
        let mut manager = RememberEventDispatcher::new(self.abandon_set.clone());
        let records = state.table.take_records();
        let mut released = Vec::new();
        for record in &records {
            for slot in &record.slots {
                match slot {
                    Slot::Remembered(holder) => manager.forgetting(holder.clone()),
                    Slot::Scope(scope) => released.push(scope.clone()),
                    _ => {}
                }
            }
        }
        for scope in released {
            scope.release();
        }
        if let Err(error) = manager.dispatch_remember_observers(&mut *self.applier.borrow_mut()) {
            log::warn!("forgetting unclaimed movable content failed: {error}");
        }
        for (_, node) in state.nodes.iter_mut() {
            node.on_release();
        }
    }

    fn verify_consistent(&self) {
        if self.busy.get() {
            panic!("verify_consistent called while composition {} is busy", self.id);
        }
        let table = self.slot_table.borrow();
        table.verify_well_formed();
        for index in 0..table.groups_size() {
            if let Some(scope) = table.record(index).scope() {
                let resolved = scope.anchor().and_then(|anchor| anchor.to_index(&table));
                if resolved != Some(index) {
                    panic!("scope {} of group {index} is anchored at {resolved:?}", scope.id());
                }
            }
        }
    }
}

impl<A: Applier + 'static> RecomposeScopeOwner for CompositionInner<A> {
    fn invalidate(&self, scope: &RecomposeScope, instance: Option<StateId>) -> InvalidationResult {
        self.invalidate_scope(scope, instance)
    }

    fn recompose_scope_released(&self, scope: &RecomposeScope) {
        self.observations.borrow_mut().remove_scope(scope);
        self.invalidations.borrow_mut().remove(scope);
    }
}

impl<A: Applier + 'static> ControlledComposition for CompositionInner<A> {
    fn id(&self) -> CompositionId {
        self.id
    }

    fn compose_content(&self, content: Content) {
        CompositionInner::compose_content(self, content);
    }

    fn recompose(&self) -> bool {
        CompositionInner::recompose(self)
    }

    fn insert_movable_content(&self, references: Vec<(MovableContentStateReference, Option<MovableContentStateReference>)>) {
        CompositionInner::insert_movable_content(self, references);
    }

    fn apply_changes(&self) -> Result<(), ComposeError> {
        CompositionInner::apply_changes(self)
    }

    fn apply_late_changes(&self) -> Result<(), ComposeError> {
        CompositionInner::apply_late_changes(self)
    }

    fn changes_applied(&self) {
        CompositionInner::changes_applied(self);
    }

    fn record_modifications_of(&self, values: &HashSet<StateId>) {
        if values.is_empty() || self.state.get() == CompositionState::Disposed {
            return;
        }
        let idle = self.pending.record(Arc::new(values.clone()));
        if idle && !self.busy.get() {
            let _busy = self.lock();
            let sets = self.pending.drain();
            self.add_pending_invalidations(sets, false);
        }
    }

    fn has_invalidations(&self) -> bool {
        !self.invalidations.borrow().is_empty() || self.pending.has_values()
    }

    fn has_pending_changes(&self) -> bool {
        !self.changes.borrow().is_empty() || !self.late_changes.borrow().is_empty()
    }

    fn is_composing(&self) -> bool {
        self.composer_state.is_composing()
    }

    fn is_disposed(&self) -> bool {
        self.state.get() == CompositionState::Disposed
    }

    fn state(&self) -> CompositionState {
        self.state.get()
    }

    fn dispose_unused_movable_content(&self, state: MovableContentState) {
        CompositionInner::dispose_unused_movable_content(self, state);
    }

    fn delegate_invalidations(&self, to: Option<Rc<dyn ControlledComposition>>, group: Anchor, block: &mut dyn FnMut()) {
        let previous = self.delegate.replace(to.map(|to| (to, group)));
        block();
        *self.delegate.borrow_mut() = previous;
    }

    fn invalidate_delegated(&self, scope: &RecomposeScope, instance: Option<StateId>) -> InvalidationResult {
        let owned = scope.anchor().is_some_and(|anchor| {
            self.slot_table
                .try_borrow()
                .is_ok_and(|table| table.owns_anchor(&anchor))
        });
        if owned {
            return self.invalidate_scope(scope, instance);
        }
        self.invalidations.borrow_mut().add(scope, instance);
        scope.mark_invalid();
        self.parent.invalidate(self.id);
        InvalidationResult::Scheduled
    }
}

/// A composition of content into the tree managed by an applier.
///
/// Dropping the handle does not tear the content down; call
/// [`dispose`](Self::dispose) first.
pub struct Composition<A: Applier + 'static> {
    inner: Rc<CompositionInner<A>>,
}

impl<A: Applier + 'static> Composition<A> {
    pub fn new(applier: A, parent: Rc<dyn CompositionContext>) -> Self {
        let id = NEXT_COMPOSITION_ID.fetch_add(1, Ordering::Relaxed);
        let inner = Rc::new_cyclic(|this| CompositionInner {
            id,
            this: this.clone(),
            parent: parent.clone(),
            slot_table: RefCell::new(SlotTable::with_root()),
            changes: RefCell::new(ChangeList::new()),
            late_changes: RefCell::new(ChangeList::new()),
            applier: RefCell::new(applier),
            children: RefCell::new(HashMap::default()),
            observations: RefCell::new(ScopeMap::new()),
            observations_processed: RefCell::new(ScopeMap::new()),
            derived_states: RefCell::new(ScopeMap::new()),
            conditionally_invalidated: RefCell::new(Vec::new()),
            invalidations: RefCell::new(Invalidations::default()),
            composer_state: ComposerState::default(),
            abandon_set: SharedAbandonSet::default(),
            abandoned: RefCell::new(HashSet::default()),
            pending: PendingSlot::default(),
            composed: Cell::new(false),
            state: Cell::new(CompositionState::Active),
            busy: Cell::new(false),
            reusing: Cell::new(false),
            delegate: RefCell::new(None),
            observers: RefCell::new(Vec::new()),
            next_observer: Cell::new(0),
        });
        let controlled: Rc<dyn ControlledComposition> = inner.clone();
        parent.register_composition(&controlled);
        Self { inner }
    }

    pub fn id(&self) -> CompositionId {
        self.inner.id
    }

    pub fn as_controlled(&self) -> Rc<dyn ControlledComposition> {
        self.inner.clone()
    }

    /// Composes `content` through the parent context and applies the result.
    pub fn set_content(&self, content: impl Fn(&mut Composer<'_>) + 'static) -> Result<(), ComposeError> {
        let controlled = self.as_controlled();
        self.inner.parent.compose_initial(&controlled, Rc::new(content))
    }

    /// Like [`set_content`](Self::set_content) after a
    /// [`deactivate`](Self::deactivate): groups and nodes of the previous
    /// content are reused when they match.
    pub fn set_content_with_reuse(&self, content: impl Fn(&mut Composer<'_>) + 'static) -> Result<(), ComposeError> {
        self.inner.reusing.set(true);
        let result = self.set_content(content);
        self.inner.reusing.set(false);
        result
    }

    pub fn compose_content(&self, content: impl Fn(&mut Composer<'_>) + 'static) {
        self.inner.compose_content(Rc::new(content));
    }

    pub fn recompose(&self) -> bool {
        self.inner.recompose()
    }

    pub fn apply_changes(&self) -> Result<(), ComposeError> {
        self.inner.apply_changes()
    }

    pub fn apply_late_changes(&self) -> Result<(), ComposeError> {
        self.inner.apply_late_changes()
    }

    pub fn changes_applied(&self) {
        self.inner.changes_applied();
    }

    pub fn record_modifications_of(&self, values: &HashSet<StateId>) {
        ControlledComposition::record_modifications_of(&*self.inner, values);
    }

    /// Handle for recording modifications from other threads.
    pub fn modification_recorder(&self) -> ModificationRecorder {
        self.inner.pending.recorder()
    }

    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    pub fn invalidate_groups_with_key(&self, key: Key) {
        self.inner.invalidate_groups_with_key(key);
    }

    pub fn observes_any_of(&self, values: &HashSet<StateId>) -> bool {
        let observations = self.inner.observations.borrow();
        let derived = self.inner.derived_states.borrow();
        values
            .iter()
            .any(|id| observations.contains(id) || derived.contains(id))
    }

    pub fn has_invalidations(&self) -> bool {
        ControlledComposition::has_invalidations(&*self.inner)
    }

    pub fn has_pending_changes(&self) -> bool {
        ControlledComposition::has_pending_changes(&*self.inner)
    }

    pub fn is_composing(&self) -> bool {
        self.inner.composer_state.is_composing()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.get() == CompositionState::Disposed
    }

    pub fn state(&self) -> CompositionState {
        self.inner.state.get()
    }

    /// Forgets every remembered object and deactivates every node, keeping
    /// the groups so the next content can reuse them.
    pub fn deactivate(&self) {
        self.inner.deactivate();
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn delegate_invalidations(&self, to: Option<Rc<dyn ControlledComposition>>, group: Anchor, mut block: impl FnMut()) {
        ControlledComposition::delegate_invalidations(&*self.inner, to, group, &mut block);
    }

    pub fn verify_consistent(&self) {
        self.inner.verify_consistent();
    }

    pub fn observe(&self, observer: Rc<dyn CompositionObserver>) -> ObserverHandle {
        let id = self.inner.next_observer.get();
        self.inner.next_observer.set(id + 1);
        self.inner.observers.borrow_mut().push((id, observer));
        let inner = Rc::downgrade(&self.inner);
        ObserverHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.observers.borrow_mut().retain(|(held, _)| *held != id);
            }
        })
    }

    pub fn with_applier<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        f(&mut self.inner.applier.borrow_mut())
    }

    pub fn with_slot_table<R>(&self, f: impl FnOnce(&SlotTable) -> R) -> R {
        f(&self.inner.slot_table.borrow())
    }
}

impl<A: Applier + 'static> fmt::Debug for Composition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Composition")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state.get())
            .field("invalidations", &self.inner.invalidations.borrow().len())
            .field("changes", &self.inner.changes.borrow().len())
            .finish()
    }
}
