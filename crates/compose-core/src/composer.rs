//! The composer walks the slot table of a composition while user code runs,
//! matching each call against the groups recorded by the previous pass.
//!
//! It never mutates the table. Everything that differs from the previous
//! pass is recorded as a [`Change`] against an anchor, and replayed when the
//! composition applies its changes.

use std::cell::{Cell, RefCell};
use std::hash::Hash;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;

use crate::applier::{allocate_node_id, Node, NodeError, NodeId};
use crate::change_list::{Arranged, Change, ChangeList};
use crate::composition::{CompositionContext, CompositionId, ControlledComposition};
use crate::effects::{DisposableEffectResult, DisposableEffectScope, DisposableEffectState};
use crate::hash::data_key;
use crate::movable_content::{MovableContent, MovableContentStateReference};
use crate::owned::Owned;
use crate::recompose_scope::{RecomposeScope, RecomposeScopeOwner, ScopeBlock};
use crate::remember::{ObserverHolder, RememberObserver, SharedAbandonSet};
use crate::slot_table::{Anchor, GroupKind, GroupRecord, Key, Slot, SlotReader, MOVABLE_CONTENT_KEY};
use crate::snapshot::StateId;

/// Composable content.
pub type Content = Rc<dyn Fn(&mut Composer<'_>)>;

pub(crate) const ROOT_CONTENT_KEY: Key = 200;
const KEYED_GROUP_KEY: Key = 201;
const MOVABLE_SCOPE_KEY: Key = 202;

/// A scope waiting to be recomposed. `instances` lists the values whose
/// change caused it; `None` means unconditionally.
#[derive(Clone, Debug)]
pub(crate) struct Invalidation {
    pub(crate) scope: RecomposeScope,
    pub(crate) instances: Option<Vec<StateId>>,
}

#[derive(Default, Debug)]
pub(crate) struct Invalidations {
    entries: Vec<Invalidation>,
}

impl Invalidations {
    pub(crate) fn add(&mut self, scope: &RecomposeScope, instance: Option<StateId>) {
        match self.entries.iter_mut().find(|entry| entry.scope == *scope) {
            Some(entry) => match (&mut entry.instances, instance) {
                (Some(instances), Some(id)) => {
                    if !instances.contains(&id) {
                        instances.push(id);
                    }
                }
                (instances @ Some(_), None) => *instances = None,
                (None, _) => {}
            },
            None => self.entries.push(Invalidation {
                scope: scope.clone(),
                instances: instance.map(|id| vec![id]),
            }),
        }
    }

    pub(crate) fn merge(&mut self, other: Invalidation) {
        match other.instances {
            None => self.add(&other.scope, None),
            Some(instances) => {
                for id in instances {
                    self.add(&other.scope, Some(id));
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, scope: &RecomposeScope) {
        self.entries.retain(|entry| entry.scope != *scope);
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&Invalidation) -> bool) {
        self.entries.retain(f);
    }

    pub(crate) fn contains(&self, scope: &RecomposeScope) -> bool {
        self.entries.iter().any(|entry| entry.scope == *scope)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Invalidation> {
        self.entries.iter()
    }

    pub(crate) fn take(&mut self) -> Vec<Invalidation> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Pass state the composer shares with its composition, so invalidations
/// raised while user code runs can be classified against the traversal.
#[derive(Default)]
pub(crate) struct ComposerState {
    pub(crate) invalidations: RefCell<Invalidations>,
    position: Cell<Option<usize>>,
    scopes: RefCell<Vec<RecomposeScope>>,
    stale_reads: RefCell<Vec<(StateId, RecomposeScope)>>,
}

impl ComposerState {
    pub(crate) fn is_composing(&self) -> bool {
        self.position.get().is_some()
    }

    /// Index of the next group the traversal will visit.
    pub(crate) fn position(&self) -> Option<usize> {
        self.position.get()
    }

    pub(crate) fn current_scope(&self) -> Option<RecomposeScope> {
        self.scopes.borrow().last().cloned()
    }

    pub(crate) fn take_stale_reads(&self) -> Vec<(StateId, RecomposeScope)> {
        std::mem::take(&mut *self.stale_reads.borrow_mut())
    }

    pub(crate) fn reset(&self) {
        self.position.set(None);
        self.scopes.borrow_mut().clear();
        self.invalidations.borrow_mut().clear();
        self.stale_reads.borrow_mut().clear();
    }
}

/// Collaborators of one composer run.
pub(crate) struct ComposerConfig<'a> {
    pub(crate) reader: SlotReader<'a>,
    pub(crate) state: &'a ComposerState,
    pub(crate) changes: &'a mut ChangeList,
    pub(crate) abandon: SharedAbandonSet,
    pub(crate) parent: Rc<dyn CompositionContext>,
    pub(crate) owner: Weak<dyn RecomposeScopeOwner>,
    pub(crate) composition: Weak<dyn ControlledComposition>,
    pub(crate) composition_id: CompositionId,
    pub(crate) root_node: NodeId,
    pub(crate) reusing: bool,
}

enum Child {
    /// Index into the frame's old children.
    Existing(usize),
    Inserted(Vec<GroupRecord>),
}

enum FrameGroup {
    Existing { index: usize, anchor: Anchor },
    New { records: Vec<GroupRecord> },
}

struct Frame {
    group: FrameGroup,
    kind: GroupKind,
    old_children: SmallVec<[usize; 8]>,
    consumed: SmallVec<[bool; 8]>,
    cursor: usize,
    order: Vec<Child>,
    slot_cursor: usize,
    node: Option<NodeId>,
    /// The node children below this group may have changed.
    structural: bool,
    /// Slots were not visited, so they must not be trimmed.
    skipped: bool,
    /// Set on the frame standing in for the parent of a scope recomposed
    /// out of order: the node to resynchronize when it ends.
    synthetic: Option<(Anchor, NodeId)>,
}

impl Frame {
    fn new(record: GroupRecord) -> Self {
        Self {
            kind: record.kind,
            group: FrameGroup::New { records: vec![record] },
            old_children: SmallVec::new(),
            consumed: SmallVec::new(),
            cursor: 0,
            order: Vec::new(),
            slot_cursor: 0,
            node: None,
            structural: false,
            skipped: false,
            synthetic: None,
        }
    }

    fn existing(reader: &SlotReader<'_>, index: usize) -> Self {
        let old_children: SmallVec<[usize; 8]> = reader.children(index).into_iter().collect();
        Self {
            kind: reader.kind(index),
            group: FrameGroup::Existing {
                index,
                anchor: reader.anchor(index),
            },
            consumed: SmallVec::from_elem(false, old_children.len()),
            old_children,
            cursor: 0,
            order: Vec::new(),
            slot_cursor: 0,
            node: reader.node(index),
            structural: false,
            skipped: false,
            synthetic: None,
        }
    }

    fn is_new(&self) -> bool {
        matches!(self.group, FrameGroup::New { .. })
    }
}

/// Drives one composition pass.
pub struct Composer<'a> {
    reader: SlotReader<'a>,
    state: &'a ComposerState,
    changes: &'a mut ChangeList,
    abandon: SharedAbandonSet,
    parent: Rc<dyn CompositionContext>,
    owner: Weak<dyn RecomposeScopeOwner>,
    composition: Weak<dyn ControlledComposition>,
    composition_id: CompositionId,
    root_node: NodeId,
    reusing: bool,
    frames: Vec<Frame>,
    detached: Option<Vec<GroupRecord>>,
}

impl<'a> Composer<'a> {
    pub(crate) fn new(config: ComposerConfig<'a>) -> Self {
        let ComposerConfig {
            reader,
            state,
            changes,
            abandon,
            parent,
            owner,
            composition,
            composition_id,
            root_node,
            reusing,
        } = config;
        Self {
            reader,
            state,
            changes,
            abandon,
            parent,
            owner,
            composition,
            composition_id,
            root_node,
            reusing,
            frames: Vec::new(),
            detached: None,
        }
    }

    // ── passes ──────────────────────────────────────────────────────────

    /// Composes `content` from the root, visiting every group.
    pub(crate) fn compose_root(&mut self, content: Content) {
        self.state.position.set(Some(0));
        self.frames.push(Frame::existing(&self.reader, 0));
        self.state.position.set(Some(1));
        let content: Rc<dyn Fn(&mut Composer<'_>, &())> = Rc::new(move |composer, _| content(composer));
        self.restart_group(ROOT_CONTENT_KEY, (), content, true);
        self.end_group();
        self.state.position.set(None);
    }

    /// Recomposes the invalidated scopes only, in slot table order.
    pub(crate) fn recompose_invalidated(&mut self) {
        self.state.position.set(Some(0));
        let end = self.reader.groups_size();
        self.recompose_nested_invalidations(0, end);
        self.state.position.set(None);
    }

    /// Composes movable content that has no state to move into a detached
    /// group. Nothing in the table is visited.
    pub(crate) fn compose_movable(&mut self, content: &MovableContent) -> Vec<GroupRecord> {
        self.state.position.set(Some(self.reader.groups_size()));
        self.frames.push(Frame::new(GroupRecord::new(
            MOVABLE_CONTENT_KEY,
            Some(content.id()),
            GroupKind::Movable,
        )));
        self.next_slot();
        self.set_last_slot(Slot::Value(Rc::new(content.clone())));
        self.movable_scope(content);
        self.end_group();
        self.state.position.set(None);
        self.detached.take().unwrap_or_default()
    }

    // ── groups ──────────────────────────────────────────────────────────

    /// Opens a group. Returns `true` if the group is being inserted.
    fn start_group(&mut self, key: Key, data_key: Option<Key>, kind: GroupKind) -> bool {
        match self.match_child(key, data_key, kind) {
            Some(index) => {
                self.frames.push(Frame::existing(&self.reader, index));
                self.state.position.set(Some(index + 1));
                false
            }
            None => {
                self.frames.push(Frame::new(GroupRecord::new(key, data_key, kind)));
                true
            }
        }
    }

    /// Finds an unconsumed child of the current group with the same identity,
    /// preferring the one at the cursor.
    fn match_child(&mut self, key: Key, data_key: Option<Key>, kind: GroupKind) -> Option<usize> {
        let reader = &self.reader;
        let frame = self.frames.last_mut()?;
        if frame.is_new() {
            return None;
        }
        let matches = |index: usize| reader.key(index) == key && reader.data_key(index) == data_key && reader.kind(index) == kind;
        let len = frame.old_children.len();
        let at_cursor = frame.cursor < len && !frame.consumed[frame.cursor] && matches(frame.old_children[frame.cursor]);
        let position = if at_cursor {
            Some(frame.cursor)
        } else {
            (0..len).find(|j| !frame.consumed[*j] && matches(frame.old_children[*j]))
        }?;
        frame.consumed[position] = true;
        while frame.cursor < len && frame.consumed[frame.cursor] {
            frame.cursor += 1;
        }
        frame.order.push(Child::Existing(position));
        Some(frame.old_children[position])
    }

    fn end_group(&mut self) {
        let Some(frame) = self.frames.pop() else {
            panic!("end_group without a matching start_group");
        };
        match frame.group {
            FrameGroup::New { mut records } => {
                records[0].size = records.len();
                if let Some(id) = records[0].node() {
                    self.changes.push(Change::SyncChildren {
                        group: records[0].anchor(),
                        node: id,
                    });
                }
                match self.frames.last_mut() {
                    Some(parent) => match &mut parent.group {
                        FrameGroup::New { records: siblings } => siblings.extend(records),
                        FrameGroup::Existing { .. } => {
                            parent.order.push(Child::Inserted(records));
                            parent.structural = true;
                        }
                    },
                    None => self.detached = Some(records),
                }
            }
            FrameGroup::Existing { .. } => self.finish_existing(frame),
        }
    }

    fn finish_existing(&mut self, frame: Frame) {
        let Frame {
            group,
            kind,
            old_children,
            consumed,
            order,
            slot_cursor,
            node,
            mut structural,
            skipped,
            synthetic,
            ..
        } = frame;
        let FrameGroup::Existing { index, anchor } = group else {
            return;
        };
        if !skipped && synthetic.is_none() && slot_cursor < self.reader.slots(index).len() {
            self.changes.push(Change::TrimSlots {
                group: anchor.clone(),
                len: slot_cursor,
            });
        }
        for (j, child) in old_children.iter().enumerate() {
            if !consumed[j] {
                self.remove_child(*child);
                structural = true;
            }
        }
        let in_order = order.iter().enumerate().all(|(position, child)| match child {
            Child::Existing(j) => *j == position,
            Child::Inserted(_) => false,
        });
        if !in_order {
            let arranged = order
                .into_iter()
                .map(|child| match child {
                    Child::Existing(j) => Arranged::Existing(self.reader.anchor(old_children[j])),
                    Child::Inserted(records) => Arranged::Inserted(records),
                })
                .collect();
            self.changes.push(Change::ArrangeChildren {
                parent: anchor.clone(),
                order: arranged,
            });
            structural = true;
        }
        if synthetic.is_none() {
            let end = index + self.reader.group_size(index);
            self.drop_invalidations_in(index, end);
            self.state.position.set(Some(end));
        }
        if !structural {
            return;
        }
        if let Some((group, node)) = synthetic {
            self.changes.push(Change::SyncChildren { group, node });
        } else if let (GroupKind::Node, Some(id)) = (kind, node) {
            self.changes.push(Change::SyncChildren { group: anchor, node: id });
        } else if kind == GroupKind::Root {
            self.changes.push(Change::SyncChildren {
                group: anchor,
                node: self.root_node,
            });
        } else if let Some(parent) = self.frames.last_mut() {
            parent.structural = true;
        }
    }

    /// Records the removal of an old child. Movable content below it is
    /// extracted instead, so it can be claimed by an insertion elsewhere.
    fn remove_child(&mut self, child: usize) {
        let end = child + self.reader.group_size(child);
        let mut extracted_self = false;
        let mut index = child;
        while index < end {
            if self.reader.kind(index) == GroupKind::Movable && self.extract_movable(index) {
                extracted_self |= index == child;
                index += self.reader.group_size(index);
            } else {
                index += 1;
            }
        }
        if !extracted_self {
            self.changes.push(Change::RemoveGroup {
                group: self.reader.anchor(child),
            });
        }
        self.drop_invalidations_in(child, end);
    }

    fn extract_movable(&mut self, index: usize) -> bool {
        let content = match self.reader.slot(index, 0) {
            Some(Slot::Value(value)) => value.downcast_ref::<MovableContent>().cloned(),
            _ => None,
        };
        let Some(content) = content else {
            log::warn!("movable group at {index} has no content");
            return false;
        };
        let anchor = self.reader.anchor(index);
        let reference = MovableContentStateReference::new(content, anchor.clone(), self.composition_id, self.composition.clone());
        self.changes.push(Change::ExtractMovable {
            group: anchor,
            reference: reference.clone(),
        });
        self.parent.delete_movable_content(reference);
        true
    }

    fn drop_invalidations_in(&self, start: usize, end: usize) {
        let table = self.reader.table();
        self.state.invalidations.borrow_mut().retain(|entry| {
            match entry.scope.anchor().and_then(|anchor| anchor.to_index(table)) {
                Some(location) => location < start || location >= end,
                None => true,
            }
        });
    }

    fn skip_to_group_end(&mut self) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let FrameGroup::Existing { index, .. } = frame.group else {
            return;
        };
        frame.skipped = true;
        for j in 0..frame.old_children.len() {
            if !frame.consumed[j] {
                frame.consumed[j] = true;
                frame.order.push(Child::Existing(j));
            }
        }
        frame.cursor = frame.old_children.len();
        let end = index + self.reader.group_size(index);
        self.recompose_nested_invalidations(index + 1, end);
    }

    fn recompose_nested_invalidations(&mut self, start: usize, end: usize) {
        while let Some((location, scope)) = self.next_invalidation(start, end) {
            self.recompose_scope_at(location, scope);
        }
    }

    fn next_invalidation(&self, start: usize, end: usize) -> Option<(usize, RecomposeScope)> {
        let position = self.state.position.get().unwrap_or(0).max(start);
        let table = self.reader.table();
        let invalidations = self.state.invalidations.borrow();
        invalidations
            .iter()
            .filter_map(|entry| {
                let location = entry.scope.anchor()?.to_index(table)?;
                (location >= position && location < end).then(|| (location, entry.scope.clone()))
            })
            .min_by_key(|(location, _)| *location)
    }

    /// Re-runs the scope at `location` under a stand-in frame for its parent.
    fn recompose_scope_at(&mut self, location: usize, scope: RecomposeScope) {
        let (Some(block), Some(parent)) = (scope.block(), self.reader.table().parent(location)) else {
            self.state.invalidations.borrow_mut().remove(&scope);
            return;
        };
        log::trace!("recomposing scope {} at {location}", scope.id());
        let mut frame = Frame::existing(&self.reader, parent);
        frame.old_children = SmallVec::from_elem(location, 1);
        frame.consumed = SmallVec::from_elem(false, 1);
        frame.synthetic = Some(self.nearest_node(location));
        self.frames.push(frame);
        self.state.position.set(Some(location));
        block(self);
        if let Some(frame) = self.frames.pop() {
            self.finish_existing(frame);
        }
        self.state.invalidations.borrow_mut().remove(&scope);
        self.state
            .position
            .set(Some(location + self.reader.group_size(location)));
    }

    fn nearest_node(&self, index: usize) -> (Anchor, NodeId) {
        for ancestor in self.reader.ancestors(index).into_iter().rev() {
            if let Some(id) = self.reader.node(ancestor) {
                return (self.reader.anchor(ancestor), id);
            }
        }
        (self.reader.anchor(0), self.root_node)
    }

    fn current_anchor(&self) -> Option<Anchor> {
        let frame = self.frames.last()?;
        Some(match &frame.group {
            FrameGroup::Existing { anchor, .. } => anchor.clone(),
            FrameGroup::New { records } => records[0].anchor(),
        })
    }

    fn current_node(&self) -> Option<NodeId> {
        self.frames.iter().rev().find_map(|frame| frame.node)
    }

    // ── slots ───────────────────────────────────────────────────────────

    fn next_slot(&mut self) -> Option<Slot> {
        let frame = self.frames.last_mut()?;
        let cursor = frame.slot_cursor;
        frame.slot_cursor += 1;
        match &frame.group {
            FrameGroup::Existing { index, .. } => self.reader.slot(*index, cursor).cloned(),
            FrameGroup::New { records } => records[0].slots.get(cursor).cloned(),
        }
    }

    /// Replaces the slot returned by the last [`next_slot`](Self::next_slot).
    fn set_last_slot(&mut self, value: Slot) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        let slot = frame.slot_cursor.saturating_sub(1);
        match &mut frame.group {
            FrameGroup::Existing { anchor, .. } => self.changes.push(Change::SetSlot {
                group: anchor.clone(),
                slot,
                value,
            }),
            FrameGroup::New { records } => {
                let slots = &mut records[0].slots;
                if slots.len() <= slot {
                    slots.resize(slot + 1, Slot::Empty);
                }
                slots[slot] = value;
            }
        }
    }

    fn remember_holder(&mut self, holder: ObserverHolder) {
        self.abandon.borrow_mut().insert(holder.clone());
        self.set_last_slot(Slot::Remembered(holder.clone()));
        self.changes.push(Change::Remember(holder));
    }

    // ── public API ──────────────────────────────────────────────────────

    pub fn is_inserting(&self) -> bool {
        self.frames.last().is_some_and(Frame::is_new)
    }

    pub fn composition_id(&self) -> CompositionId {
        self.composition_id
    }

    /// The scope whose content is running.
    pub fn current_recompose_scope(&self) -> Option<RecomposeScope> {
        self.state.current_scope()
    }

    /// Runs `content` inside a group keyed by its call site.
    pub fn group<R>(&mut self, key: Key, content: impl FnOnce(&mut Composer<'_>) -> R) -> R {
        self.start_group(key, None, GroupKind::Plain);
        let result = content(self);
        self.end_group();
        result
    }

    /// Runs `content` inside a group identified by `key`, so it keeps its
    /// state when it moves among its siblings.
    pub fn with_key<K: Hash + ?Sized, R>(&mut self, key: &K, content: impl FnOnce(&mut Composer<'_>) -> R) -> R {
        self.start_group(KEYED_GROUP_KEY, Some(data_key(key)), GroupKind::Keyed);
        let result = content(self);
        self.end_group();
        result
    }

    /// Calls a restartable composable. The call is skipped when `params`
    /// equal the previous call's and the scope is not invalid.
    pub fn composable<P: PartialEq + Clone + 'static>(
        &mut self,
        key: Key,
        params: P,
        content: impl Fn(&mut Composer<'_>, &P) + 'static,
    ) {
        self.restart_group(key, params, Rc::new(content), false);
    }

    fn restart_group<P: PartialEq + Clone + 'static>(
        &mut self,
        key: Key,
        params: P,
        content: Rc<dyn Fn(&mut Composer<'_>, &P)>,
        force: bool,
    ) {
        let inserting = self.start_group(key, None, GroupKind::Restart);
        let scope = match self.next_slot() {
            Some(Slot::Scope(scope)) if !inserting => scope,
            _ => {
                let scope = RecomposeScope::new(self.owner.clone());
                if let Some(anchor) = self.current_anchor() {
                    scope.set_anchor(anchor);
                }
                self.set_last_slot(Slot::Scope(scope.clone()));
                scope
            }
        };
        let previous = match self.next_slot() {
            Some(Slot::Value(value)) => value.downcast_ref::<P>().cloned(),
            _ => None,
        };
        let params_changed = previous.as_ref() != Some(&params);
        if params_changed {
            self.set_last_slot(Slot::Value(Rc::new(params.clone())));
        }
        if !(force || inserting || self.reusing || params_changed || scope.is_invalid()) {
            self.skip_to_group_end();
            self.end_group();
            return;
        }
        let block: ScopeBlock = {
            let params = params.clone();
            let content = content.clone();
            Rc::new(move |composer: &mut Composer<'_>| {
                composer.restart_group(key, params.clone(), content.clone(), false)
            })
        };
        scope.set_block(block);
        self.run_scope(&scope, |composer| content(composer, &params));
        self.end_group();
    }

    fn run_scope(&mut self, scope: &RecomposeScope, body: impl FnOnce(&mut Composer<'_>)) {
        self.state.invalidations.borrow_mut().remove(scope);
        scope.start();
        self.state.scopes.borrow_mut().push(scope.clone());
        body(self);
        self.state.scopes.borrow_mut().pop();
        let stale = scope.end();
        if !stale.is_empty() {
            self.state
                .stale_reads
                .borrow_mut()
                .extend(stale.into_iter().map(|id| (id, scope.clone())));
        }
    }

    /// Remembers the value produced by `init` for as long as this call site
    /// stays in the composition.
    pub fn remember<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Owned<T> {
        if let Some(Slot::Value(value)) = self.next_slot() {
            if let Ok(owned) = value.downcast::<Owned<T>>() {
                return (*owned).clone();
            }
        }
        let owned = Owned::new(init());
        self.set_last_slot(Slot::Value(Rc::new(owned.clone())));
        owned
    }

    /// Like [`remember`](Self::remember) for objects that want to hear when
    /// they enter and leave the composition.
    pub fn remember_observer<T: RememberObserver + 'static>(&mut self, init: impl FnOnce() -> T) -> Rc<T> {
        if let Some(Slot::Remembered(holder)) = self.next_slot() {
            if let Ok(value) = holder.value().clone().downcast::<T>() {
                return value;
            }
        }
        let value = Rc::new(init());
        self.remember_holder(ObserverHolder::new(value.clone()));
        value
    }

    /// Stores `value` and reports whether it differs from the previous pass.
    pub fn changed<T: PartialEq + Clone + 'static>(&mut self, value: &T) -> bool {
        if let Some(Slot::Value(previous)) = self.next_slot() {
            if previous.downcast_ref::<T>() == Some(value) {
                return false;
            }
        }
        self.set_last_slot(Slot::Value(Rc::new(value.clone())));
        true
    }

    /// Runs `effect` after the changes of this pass are applied, and its
    /// cleanup when the call leaves the composition or `keys` change.
    pub fn disposable_effect<K: PartialEq + Clone + 'static>(
        &mut self,
        keys: K,
        effect: impl FnOnce(DisposableEffectScope) -> DisposableEffectResult + 'static,
    ) {
        let keys_changed = self.changed(&keys);
        let current = self.next_slot();
        let kept = matches!(&current, Some(Slot::Remembered(holder)) if holder.value().is::<DisposableEffectState>());
        if kept && !keys_changed {
            return;
        }
        let state = Rc::new(DisposableEffectState::new(effect));
        self.remember_holder(ObserverHolder::new(state));
    }

    /// Runs `effect` once the changes of this pass are applied.
    pub fn side_effect(&mut self, effect: impl FnOnce() + 'static) {
        self.changes.push(Change::SideEffect(Box::new(effect)));
    }

    /// Emits a node. `factory` runs at apply time, only when the node is new.
    pub fn node<N: Node + 'static>(
        &mut self,
        key: Key,
        factory: impl FnOnce() -> N + 'static,
        content: impl FnOnce(&mut Composer<'_>),
    ) -> NodeId {
        let inserting = self.start_group(key, None, GroupKind::Node);
        let existing = match self.next_slot() {
            Some(Slot::Node(id)) if !inserting => Some(id),
            _ => None,
        };
        let id = match existing {
            Some(id) => {
                if self.reusing {
                    self.changes.push(Change::ReuseNode { id });
                }
                id
            }
            None => {
                let id = allocate_node_id();
                self.set_last_slot(Slot::Node(id));
                self.changes.push(Change::CreateNode {
                    id,
                    factory: Box::new(move || -> Box<dyn Node> { Box::new(factory()) }),
                });
                id
            }
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.node = Some(id);
        }
        content(self);
        self.end_group();
        id
    }

    /// Updates the enclosing node when `value` changed since the last pass.
    pub fn node_property<N: Node + 'static, V: PartialEq + Clone + 'static>(
        &mut self,
        value: V,
        apply: impl FnOnce(&mut N, V) + 'static,
    ) {
        if !self.changed(&value) {
            return;
        }
        let Some(id) = self.current_node() else {
            panic!("node_property called outside of a node");
        };
        self.update_node(id, move |node: &mut N| apply(node, value));
    }

    /// Schedules `update` against node `id` at apply time.
    pub fn update_node<N: Node + 'static>(&mut self, id: NodeId, update: impl FnOnce(&mut N) + 'static) {
        self.changes.push(Change::UpdateNode {
            id,
            update: Box::new(move |node: &mut dyn Node| {
                let typed = node.as_any_mut().downcast_mut::<N>().ok_or(NodeError::TypeMismatch {
                    id,
                    expected: std::any::type_name::<N>(),
                })?;
                update(typed);
                Ok(())
            }),
        });
    }

    /// Places `content`. When the same content was removed elsewhere in the
    /// same pass, its state and nodes move here instead of being recreated.
    pub fn movable_content(&mut self, content: &MovableContent) {
        let inserting = self.start_group(MOVABLE_CONTENT_KEY, Some(content.id()), GroupKind::Movable);
        self.next_slot();
        if inserting {
            self.set_last_slot(Slot::Value(Rc::new(content.clone())));
            if let Some(anchor) = self.current_anchor() {
                let reference = MovableContentStateReference::new(content.clone(), anchor, self.composition_id, self.composition.clone());
                self.parent.insert_movable_content(reference);
            }
        } else {
            self.movable_scope(content);
        }
        self.end_group();
    }

    fn movable_scope(&mut self, content: &MovableContent) {
        let content = content.content();
        let body: Rc<dyn Fn(&mut Composer<'_>, &())> = Rc::new(move |composer, _| content(composer));
        self.restart_group(MOVABLE_SCOPE_KEY, (), body, false);
    }
}

impl std::fmt::Debug for Composer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composer")
            .field("composition", &self.composition_id)
            .field("depth", &self.frames.len())
            .field("inserting", &self.is_inserting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompose_scope::InvalidationResult;

    struct NoOwner;

    impl RecomposeScopeOwner for NoOwner {
        fn invalidate(&self, _scope: &RecomposeScope, _instance: Option<StateId>) -> InvalidationResult {
            InvalidationResult::Ignored
        }

        fn recompose_scope_released(&self, _scope: &RecomposeScope) {}
    }

    #[test]
    fn invalidations_merge_instances_and_none_dominates() {
        let scope = RecomposeScope::new(Weak::<NoOwner>::new());
        let (a, b) = (StateId::next(), StateId::next());
        let mut list = Invalidations::default();
        list.add(&scope, Some(a));
        list.add(&scope, Some(b));
        list.add(&scope, Some(a));
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().and_then(|e| e.instances.clone()), Some(vec![a, b]));
        list.add(&scope, None);
        assert_eq!(list.iter().next().and_then(|e| e.instances.clone()), None);
        list.add(&scope, Some(a));
        assert_eq!(list.iter().next().and_then(|e| e.instances.clone()), None);
    }

    #[test]
    fn removing_a_scope_drops_its_entry() {
        let scope = RecomposeScope::new(Weak::<NoOwner>::new());
        let mut list = Invalidations::default();
        list.add(&scope, None);
        assert!(list.contains(&scope));
        list.remove(&scope);
        assert!(list.is_empty());
    }
}
