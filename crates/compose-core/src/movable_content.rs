//! Content whose state can move between positions and compositions.
//!
//! Removing a movable group from one place extracts its records into a
//! [`MovableContentState`]. Inserting the same content elsewhere leaves a
//! placeholder group behind and reports a [`MovableContentStateReference`]
//! to the parent context, which pairs insertions with extractions. A paired
//! insertion is filled with the extracted state during the late changes of
//! the destination, after every extraction has been applied.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::applier::{Node, NodeId};
use crate::composer::Content;
use crate::composition::{CompositionId, ControlledComposition};
use crate::slot_table::{Anchor, Key, SlotTable};

static NEXT_CONTENT_ID: AtomicU64 = AtomicU64::new(1);

/// Composable content with a stable identity.
#[derive(Clone)]
pub struct MovableContent {
    id: Key,
    content: Content,
}

impl MovableContent {
    pub fn id(&self) -> Key {
        self.id
    }

    pub(crate) fn content(&self) -> Content {
        self.content.clone()
    }
}

impl PartialEq for MovableContent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for MovableContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovableContent").field("id", &self.id).finish()
    }
}

pub fn movable_content_of(content: impl Fn(&mut crate::composer::Composer<'_>) + 'static) -> MovableContent {
    MovableContent {
        id: NEXT_CONTENT_ID.fetch_add(1, Ordering::Relaxed),
        content: Rc::new(content),
    }
}

/// Records and detached nodes of extracted movable content.
pub struct MovableContentState {
    pub(crate) table: SlotTable,
    pub(crate) nodes: Vec<(NodeId, Box<dyn Node>)>,
}

impl MovableContentState {
    pub(crate) fn new(table: SlotTable) -> Self {
        Self {
            table,
            nodes: Vec::new(),
        }
    }

    pub fn groups_size(&self) -> usize {
        self.table.groups_size()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|(id, _)| *id).collect()
    }
}

impl fmt::Debug for MovableContentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovableContentState")
            .field("groups", &self.table.groups_size())
            .field("nodes", &self.node_ids())
            .finish()
    }
}

/// Filled when the extraction is applied, emptied when the state is claimed.
pub(crate) type MovableStateCell = Rc<RefCell<Option<MovableContentState>>>;

/// Where a piece of movable content left from or is going to.
#[derive(Clone)]
pub struct MovableContentStateReference {
    pub(crate) content: MovableContent,
    pub(crate) anchor: Anchor,
    pub(crate) composition_id: CompositionId,
    pub(crate) composition: Weak<dyn ControlledComposition>,
    pub(crate) state: MovableStateCell,
}

impl MovableContentStateReference {
    pub(crate) fn new(
        content: MovableContent,
        anchor: Anchor,
        composition_id: CompositionId,
        composition: Weak<dyn ControlledComposition>,
    ) -> Self {
        Self {
            content,
            anchor,
            composition_id,
            composition,
            state: Rc::new(RefCell::new(None)),
        }
    }

    pub fn content_id(&self) -> Key {
        self.content.id
    }

    pub fn composition_id(&self) -> CompositionId {
        self.composition_id
    }

    pub(crate) fn composition(&self) -> Option<Rc<dyn ControlledComposition>> {
        self.composition.upgrade()
    }

    /// Takes the extracted state, leaving the reference empty.
    pub(crate) fn take_state(&self) -> Option<MovableContentState> {
        self.state.borrow_mut().take()
    }

    pub fn has_state(&self) -> bool {
        self.state.borrow().is_some()
    }
}

impl fmt::Debug for MovableContentStateReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MovableContentStateReference")
            .field("content", &self.content.id)
            .field("composition", &self.composition_id)
            .field("anchor", &self.anchor)
            .finish()
    }
}
