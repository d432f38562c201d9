use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use crate::applier::Applier;
use crate::collections::map::HashSet;
use crate::composer::Content;
use crate::composition::{
    Composition, CompositionContext, CompositionId, CompositionObserver, CompositionState, ControlledComposition,
};
use crate::error::ComposeError;
use crate::movable_content::{MovableContentState, MovableContentStateReference};
use crate::platform::{DefaultScheduler, RuntimeScheduler};
use crate::slot_table::Slot;
use crate::snapshot::{DataSourceRegistry, DerivedState, MutableState, ObserverHandle, SnapshotSystem, StateId};

type MovablePair = (MovableContentStateReference, Option<MovableContentStateReference>);

struct RecomposerInner {
    scheduler: Arc<dyn RuntimeScheduler>,
    registry: DataSourceRegistry,
    snapshot: Rc<SnapshotSystem>,
    handles: RefCell<Vec<ObserverHandle>>,
    compositions: RefCell<Vec<(CompositionId, Weak<dyn ControlledComposition>)>>, // FUTURE(no_std): replace Vec with slab keyed by id.
    movable_inserts: RefCell<Vec<MovableContentStateReference>>,
    movable_removes: RefCell<Vec<MovableContentStateReference>>,
    released: RefCell<Vec<MovableContentStateReference>>,
    needs_frame: Cell<bool>,
    observer: RefCell<Option<Rc<dyn CompositionObserver>>>,
}

impl RecomposerInner {
    fn schedule(&self) {
        self.needs_frame.set(true);
        self.scheduler.schedule_frame();
    }

    fn live_compositions(&self) -> Vec<Rc<dyn ControlledComposition>> {
        let mut compositions = self.compositions.borrow_mut();
        compositions.retain(|(_, composition)| composition.strong_count() > 0);
        compositions
            .iter()
            .filter_map(|(_, composition)| composition.upgrade())
            .collect()
    }

    fn record_modifications_of(&self, values: &HashSet<StateId>) {
        for composition in self.live_compositions() {
            composition.record_modifications_of(values);
        }
    }

    /// Pairs every inserted movable content with a removal of the same
    /// content, preferring a removal from the same composition.
    fn take_movable_pairs(&self) -> Vec<MovablePair> {
        let inserts = std::mem::take(&mut *self.movable_inserts.borrow_mut());
        let mut removes = std::mem::take(&mut *self.movable_removes.borrow_mut());
        inserts
            .into_iter()
            .map(|to| {
                let same = removes
                    .iter()
                    .position(|from| from.content_id() == to.content_id() && from.composition_id() == to.composition_id());
                let any = || removes.iter().position(|from| from.content_id() == to.content_id());
                let from = same.or_else(any).map(|index| removes.remove(index));
                (to, from)
            })
            .collect()
    }

    fn insert_pending_movable_content(&self) {
        loop {
            let pairs = self.take_movable_pairs();
            if pairs.is_empty() {
                return;
            }
            let mut local: Vec<(Rc<dyn ControlledComposition>, Vec<MovablePair>)> = Vec::new();
            for (to, from) in pairs {
                let Some(destination) = to.composition() else {
                    continue;
                };
                let source = from
                    .as_ref()
                    .filter(|from| from.composition_id() != to.composition_id())
                    .and_then(MovableContentStateReference::composition);
                match (source, from) {
                    (Some(source), Some(from)) => {
                        log::debug!(
                            "moving movable content {} from composition {} to {}",
                            to.content_id(),
                            source.id(),
                            destination.id()
                        );
                        let group = from.anchor.clone();
                        let mut pair = Some((to, Some(from)));
                        let target = destination.clone();
                        source.delegate_invalidations(Some(destination), group, &mut || {
                            if let Some(pair) = pair.take() {
                                target.insert_movable_content(vec![pair]);
                            }
                        });
                    }
                    (_, from) => match local.iter_mut().find(|(held, _)| held.id() == destination.id()) {
                        Some((_, batch)) => batch.push((to, from)),
                        None => local.push((destination, vec![(to, from)])),
                    },
                }
            }
            for (destination, batch) in local {
                destination.insert_movable_content(batch);
            }
        }
    }

    /// Applies everything the frame produced. `composed` lists the
    /// compositions that ran a pass.
    fn apply_frame(&self, composed: Vec<Rc<dyn ControlledComposition>>) -> Result<(), ComposeError> {
        self.insert_pending_movable_content();
        let mut targets = composed;
        for composition in self.live_compositions() {
            let listed = targets.iter().any(|held| held.id() == composition.id());
            if !listed && composition.has_pending_changes() {
                targets.push(composition);
            }
        }
        targets.retain(|composition| composition.state() == CompositionState::Active);
        let mut first_error = None;
        for composition in &targets {
            if let Err(error) = composition.apply_changes() {
                log::warn!("composition {} failed to apply changes: {error}", composition.id());
                first_error.get_or_insert(error);
            }
        }
        for composition in &targets {
            if composition.state() != CompositionState::Active {
                continue;
            }
            if let Err(error) = composition.apply_late_changes() {
                log::warn!("composition {} failed to apply late changes: {error}", composition.id());
                first_error.get_or_insert(error);
            }
        }
        for composition in &targets {
            composition.changes_applied();
        }
        self.dispose_unclaimed();
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn dispose_unclaimed(&self) {
        let released = std::mem::take(&mut *self.released.borrow_mut());
        for reference in released {
            let Some(state) = reference.take_state() else {
                continue;
            };
            match reference.composition() {
                Some(owner) if !owner.is_disposed() => owner.dispose_unused_movable_content(state),
                _ => drop_unclaimed(state),
            }
        }
    }
}

/// Tears down content whose composition is gone: remembered objects are
/// forgotten last first, scopes released and detached nodes released.
fn drop_unclaimed(mut state: MovableContentState) {
    log::warn!("dropping movable content of a disposed composition");
    let records = state.table.take_records();
    for slot in records.iter().rev().flat_map(|record| record.slots.iter().rev()) {
        match slot {
            Slot::Remembered(holder) => holder.observer().on_forgotten(),
            Slot::Scope(scope) => scope.release(),
            _ => {}
        }
    }
    for (_, node) in state.nodes.iter_mut() {
        node.on_release();
    }
}

impl CompositionContext for RecomposerInner {
    fn data_sources(&self) -> DataSourceRegistry {
        self.registry.clone()
    }

    fn compose_initial(&self, composition: &Rc<dyn ControlledComposition>, content: Content) -> Result<(), ComposeError> {
        composition.compose_content(content);
        self.apply_frame(vec![composition.clone()])
    }

    fn invalidate(&self, composition: CompositionId) {
        log::trace!("composition {composition} requested a frame");
        self.schedule();
    }

    fn register_composition(&self, composition: &Rc<dyn ControlledComposition>) {
        self.compositions
            .borrow_mut()
            .push((composition.id(), Rc::downgrade(composition)));
    }

    fn unregister_composition(&self, composition: CompositionId) {
        self.compositions
            .borrow_mut()
            .retain(|(id, _)| *id != composition);
    }

    fn insert_movable_content(&self, reference: MovableContentStateReference) {
        self.movable_inserts.borrow_mut().push(reference);
        self.schedule();
    }

    fn delete_movable_content(&self, reference: MovableContentStateReference) {
        self.movable_removes.borrow_mut().push(reference);
    }

    fn movable_content_state_released(&self, reference: MovableContentStateReference) {
        self.released.borrow_mut().push(reference);
    }

    fn movable_content_state_resolve(&self, reference: &MovableContentStateReference) -> Option<MovableContentState> {
        let mut released = self.released.borrow_mut();
        let index = released
            .iter()
            .position(|held| Rc::ptr_eq(&held.state, &reference.state))?;
        released.remove(index).take_state()
    }

    fn observer(&self) -> Option<Rc<dyn CompositionObserver>> {
        self.observer.borrow().clone()
    }
}

/// Drives the compositions created against it: collects state changes,
/// recomposes invalid compositions and applies their changes once per
/// frame.
#[derive(Clone)]
pub struct Recomposer {
    inner: Rc<RecomposerInner>,
}

impl Default for Recomposer {
    fn default() -> Self {
        Self::new(Arc::new(DefaultScheduler))
    }
}

impl Recomposer {
    pub fn new(scheduler: Arc<dyn RuntimeScheduler>) -> Self {
        let registry = DataSourceRegistry::new();
        let (snapshot, snapshot_handle) = SnapshotSystem::install(&registry);
        let inner = Rc::new(RecomposerInner {
            scheduler,
            registry: registry.clone(),
            snapshot,
            handles: RefCell::new(Vec::new()),
            compositions: RefCell::new(Vec::new()),
            movable_inserts: RefCell::new(Vec::new()),
            movable_removes: RefCell::new(Vec::new()),
            released: RefCell::new(Vec::new()),
            needs_frame: Cell::new(false),
            observer: RefCell::new(None),
        });
        let weak = Rc::downgrade(&inner);
        let invalidator = registry.register_invalidator(move |values| {
            if let Some(inner) = weak.upgrade() {
                inner.record_modifications_of(values);
            }
        });
        inner
            .handles
            .borrow_mut()
            .extend([snapshot_handle, invalidator]);
        Self { inner }
    }

    /// The parent context handed to new compositions.
    pub fn context(&self) -> Rc<dyn CompositionContext> {
        self.inner.clone()
    }

    pub fn composition<A: Applier + 'static>(&self, applier: A) -> Composition<A> {
        Composition::new(applier, self.context())
    }

    pub fn data_sources(&self) -> DataSourceRegistry {
        self.inner.registry.clone()
    }

    pub fn snapshot(&self) -> Rc<SnapshotSystem> {
        self.inner.snapshot.clone()
    }

    pub fn mutable_state_of<T: Clone + PartialEq + 'static>(&self, value: T) -> MutableState<T> {
        self.inner.snapshot.mutable_state_of(value)
    }

    pub fn derived_state_of<T: Clone + PartialEq + 'static>(&self, compute: impl Fn() -> T + 'static) -> DerivedState<T> {
        self.inner.snapshot.derived_state_of(compute)
    }

    pub fn set_observer(&self, observer: Option<Rc<dyn CompositionObserver>>) {
        *self.inner.observer.borrow_mut() = observer;
    }

    pub fn needs_frame(&self) -> bool {
        self.inner.needs_frame.get()
    }

    pub fn composition_count(&self) -> usize {
        self.inner.live_compositions().len()
    }

    /// True if any composition has invalidations or unapplied changes.
    pub fn has_pending_work(&self) -> bool {
        !self.inner.movable_inserts.borrow().is_empty()
            || self
                .inner
                .live_compositions()
                .iter()
                .any(|composition| composition.has_invalidations() || composition.has_pending_changes())
    }

    /// Runs one frame. Returns `true` if any composition recomposed.
    ///
    /// Every composition with invalidations recomposes, movable content is
    /// inserted, and then changes, late changes and the post-apply hook run
    /// for each composition in turn. Extractions are therefore applied
    /// before any insertion of the same content.
    pub fn run_recompose_and_apply_changes(&self) -> Result<bool, ComposeError> {
        self.inner.needs_frame.set(false);
        let mut composed = Vec::new();
        for composition in self.inner.live_compositions() {
            if composition.state() != CompositionState::Active || !composition.has_invalidations() {
                continue;
            }
            if composition.recompose() {
                composed.push(composition);
            }
        }
        let recomposed = !composed.is_empty();
        if recomposed || !self.inner.movable_inserts.borrow().is_empty() {
            log::debug!("frame recomposed {} composition(s)", composed.len());
        }
        self.inner.apply_frame(composed)?;
        Ok(recomposed)
    }

    /// Stops forwarding state changes. Compositions keep their content
    /// until disposed.
    pub fn close(&self) {
        for mut handle in self.inner.handles.borrow_mut().drain(..) {
            handle.dispose();
        }
    }
}

impl std::fmt::Debug for Recomposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recomposer")
            .field("compositions", &self.inner.compositions.borrow().len())
            .field("needs_frame", &self.inner.needs_frame.get())
            .finish()
    }
}
