use std::fmt;

use crate::applier::{Applier, Node, NodeError, NodeId};
use crate::collections::map::HashMap;
use crate::movable_content::{MovableContentState, MovableContentStateReference};
use crate::recompose_scope::RecomposeScope;
use crate::remember::{ObserverHolder, RememberEventDispatcher, RememberManager};
use crate::slot_table::{Anchor, GroupKind, GroupRecord, Slot, SlotTable};

pub(crate) type NodeFactory = Box<dyn FnOnce() -> Box<dyn Node>>;
pub(crate) type NodeUpdate = Box<dyn FnOnce(&mut dyn Node) -> Result<(), NodeError>>;

/// Child of a group after an arrangement.
pub(crate) enum Arranged {
    Existing(Anchor),
    Inserted(Vec<GroupRecord>),
}

/// What fills a movable content placeholder.
pub(crate) enum MovableFill {
    Moved(MovableContentStateReference),
    Fresh(Vec<GroupRecord>),
}

/// A deferred operation recorded by the composer.
pub(crate) enum Change {
    SetSlot { group: Anchor, slot: usize, value: Slot },
    TrimSlots { group: Anchor, len: usize },
    RemoveGroup { group: Anchor },
    ArrangeChildren { parent: Anchor, order: Vec<Arranged> },
    ExtractMovable { group: Anchor, reference: MovableContentStateReference },
    FillMovable { placeholder: Anchor, fill: MovableFill },
    CreateNode { id: NodeId, factory: NodeFactory },
    UpdateNode { id: NodeId, update: NodeUpdate },
    ReuseNode { id: NodeId },
    SyncChildren { group: Anchor, node: NodeId },
    Remember(ObserverHolder),
    SideEffect(Box<dyn FnOnce()>),
}

impl Change {
    fn name(&self) -> &'static str {
        match self {
            Change::SetSlot { .. } => "SetSlot",
            Change::TrimSlots { .. } => "TrimSlots",
            Change::RemoveGroup { .. } => "RemoveGroup",
            Change::ArrangeChildren { .. } => "ArrangeChildren",
            Change::ExtractMovable { .. } => "ExtractMovable",
            Change::FillMovable { .. } => "FillMovable",
            Change::CreateNode { .. } => "CreateNode",
            Change::UpdateNode { .. } => "UpdateNode",
            Change::ReuseNode { .. } => "ReuseNode",
            Change::SyncChildren { .. } => "SyncChildren",
            Change::Remember(_) => "Remember",
            Change::SideEffect(_) => "SideEffect",
        }
    }
}

impl fmt::Debug for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Collaborators a replay mutates.
pub(crate) struct ApplyContext<'a> {
    pub(crate) applier: &'a mut dyn Applier,
    pub(crate) table: &'a mut SlotTable,
    pub(crate) manager: &'a mut RememberEventDispatcher,
    /// Children of every node as last synchronized with the applier.
    pub(crate) children: &'a mut HashMap<NodeId, Vec<NodeId>>,
    pub(crate) root_node: NodeId,
    pub(crate) resolve: &'a dyn Fn(&MovableContentStateReference) -> Option<MovableContentState>,
}

/// Bookkeeping a replay hands back to its composition.
#[derive(Default)]
pub(crate) struct ApplyReport {
    pub(crate) released: Vec<RecomposeScope>,
    pub(crate) adopted: Vec<RecomposeScope>,
    pub(crate) extracted: Vec<MovableContentStateReference>,
}

/// Ordered log of deferred changes.
#[derive(Default)]
pub struct ChangeList {
    changes: Vec<Change>, // FUTURE(no_std): replace Vec with ring buffer.
}

impl fmt::Debug for ChangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.changes.iter()).finish()
    }
}

impl ChangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub(crate) fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    /// Drops everything except pending extractions of movable content.
    pub(crate) fn retain_extractions(&mut self) {
        self.changes
            .retain(|change| matches!(change, Change::ExtractMovable { .. }));
    }

    /// Replays every change in recorded order, then synchronizes node
    /// children: every detach of every synchronized node runs before any
    /// insert, so a node can leave one parent and join another in one replay.
    pub(crate) fn execute_and_flush_all_pending_changes(&mut self, ctx: ApplyContext<'_>) -> Result<ApplyReport, NodeError> {
        let ApplyContext {
            applier,
            table,
            manager,
            children,
            root_node,
            resolve,
        } = ctx;
        let changes = std::mem::take(&mut self.changes);
        let mut report = ApplyReport::default();
        let mut syncs: Vec<(Anchor, NodeId)> = Vec::new();
        {
            let mut writer = table.open_writer();
            for change in changes {
                match change {
                    Change::SetSlot { group, slot, value } => {
                        if let Some(index) = writer.index_of(&group) {
                            let previous = writer.set_slot(index, slot, value);
                            forget_slot(&previous, manager, &mut report);
                        }
                    }
                    Change::TrimSlots { group, len } => {
                        if let Some(index) = writer.index_of(&group) {
                            for slot in writer.trim_slots(index, len) {
                                forget_slot(&slot, manager, &mut report);
                            }
                        }
                    }
                    Change::RemoveGroup { group } => {
                        if let Some(index) = writer.index_of(&group) {
                            let removed = writer.remove_group_at(index);
                            forget_records(&removed, manager, children, &mut report);
                        }
                    }
                    Change::ArrangeChildren { parent, order } => {
                        if writer.index_of(&parent).is_none() {
                            continue;
                        }
                        for (position, entry) in order.into_iter().enumerate() {
                            match entry {
                                Arranged::Existing(anchor) => {
                                    let Some(index) = writer.index_of(&anchor) else {
                                        continue;
                                    };
                                    if writer.position_in_parent(index) != Some(position) {
                                        writer.move_group(&anchor, &parent, position);
                                    }
                                }
                                Arranged::Inserted(records) => {
                                    writer.insert_group(&parent, position, records);
                                }
                            }
                        }
                    }
                    Change::ExtractMovable { group, reference } => {
                        if let Some(index) = writer.index_of(&group) {
                            let records = writer.detach_group(index);
                            *reference.state.borrow_mut() = Some(MovableContentState::new(SlotTable::from_records(records)));
                            report.extracted.push(reference);
                        }
                    }
                    Change::FillMovable { placeholder, fill } => {
                        let Some(index) = writer.index_of(&placeholder) else {
                            log::warn!("movable content placeholder {placeholder:?} is gone");
                            continue;
                        };
                        let (records, nodes, moved) = match fill {
                            MovableFill::Fresh(records) => (records, Vec::new(), false),
                            MovableFill::Moved(reference) => match resolve(&reference) {
                                Some(mut state) => (state.table.take_records(), std::mem::take(&mut state.nodes), true),
                                None => {
                                    log::warn!("movable content {} has no state to move", reference.content_id());
                                    continue;
                                }
                            },
                        };
                        let Some(parent) = writer.table().parent(index) else {
                            continue;
                        };
                        let position = writer.position_in_parent(index).unwrap_or(0);
                        writer.remove_group_at(index);
                        let inserted = writer.insert_records(parent, position, records);
                        for (id, node) in nodes {
                            applier.create(id, node)?;
                        }
                        let table = writer.table();
                        let end = inserted + table.record(inserted).size;
                        for group in inserted..end {
                            let record = table.record(group);
                            if let Some(id) = record.node() {
                                syncs.push((table.anchor_at(group), id));
                            }
                            if moved {
                                report.adopted.extend(record.slots.iter().filter_map(|slot| match slot {
                                    Slot::Scope(scope) => Some(scope.clone()),
                                    _ => None,
                                }));
                            }
                        }
                        syncs.push(nearest_node(table, inserted, root_node));
                    }
                    Change::CreateNode { id, factory } => {
                        applier.create(id, factory())?;
                        children.insert(id, Vec::new());
                    }
                    Change::UpdateNode { id, update } => {
                        update(applier.get_mut(id)?)?;
                    }
                    Change::ReuseNode { id } => {
                        applier.get_mut(id)?.on_reuse();
                    }
                    Change::SyncChildren { group, node } => syncs.push((group, node)),
                    Change::Remember(holder) => manager.remembering(holder),
                    Change::SideEffect(effect) => manager.side_effect(effect),
                }
            }
        }
        sync_children(&mut *applier, table, children, syncs)?;
        for reference in &report.extracted {
            detach_extracted_nodes(&mut *applier, children, reference)?;
        }
        Ok(report)
    }
}

fn forget_slot(slot: &Slot, manager: &mut RememberEventDispatcher, report: &mut ApplyReport) {
    match slot {
        Slot::Remembered(holder) => manager.forgetting(holder.clone()),
        Slot::Scope(scope) => report.released.push(scope.clone()),
        _ => {}
    }
}

pub(crate) fn forget_records(
    records: &[GroupRecord],
    manager: &mut RememberEventDispatcher,
    children: &mut HashMap<NodeId, Vec<NodeId>>,
    report: &mut ApplyReport,
) {
    for record in records {
        if let Some(id) = record.node() {
            manager.releasing(id);
            children.remove(&id);
        }
        for slot in &record.slots {
            forget_slot(slot, manager, report);
        }
    }
}

/// The node group enclosing `index`, or the root.
fn nearest_node(table: &SlotTable, index: usize, root_node: NodeId) -> (Anchor, NodeId) {
    for ancestor in table.ancestors(index).into_iter().rev() {
        let record = table.record(ancestor);
        if record.kind == GroupKind::Node {
            if let Some(id) = record.node() {
                return (table.anchor_at(ancestor), id);
            }
        }
    }
    (table.anchor_at(0), root_node)
}

fn sync_children(
    applier: &mut dyn Applier,
    table: &SlotTable,
    children: &mut HashMap<NodeId, Vec<NodeId>>,
    syncs: Vec<(Anchor, NodeId)>,
) -> Result<(), NodeError> {
    let mut targets: Vec<(NodeId, Vec<NodeId>)> = Vec::new();
    for (anchor, node) in syncs {
        if targets.iter().any(|(held, _)| *held == node) {
            continue;
        }
        if let Some(index) = table.anchor_index(&anchor) {
            targets.push((node, table.child_nodes(index)));
        }
    }
    for (node, desired) in &targets {
        let current = children.entry(*node).or_default();
        let mut position = current.len();
        while position > 0 {
            position -= 1;
            if !desired.contains(&current[position]) {
                applier.remove(*node, position, 1)?;
                current.remove(position);
            }
        }
    }
    for (node, desired) in targets {
        let current = children.entry(node).or_default();
        for (position, child) in desired.iter().enumerate() {
            if current.get(position) == Some(child) {
                continue;
            }
            match current.iter().position(|held| held == child) {
                Some(from) => {
                    applier.move_children(node, from, position, 1)?;
                    let moved = current.remove(from);
                    current.insert(position, moved);
                }
                None => {
                    applier.insert(node, position, *child)?;
                    current.insert(position, *child);
                }
            }
        }
    }
    Ok(())
}

fn detach_extracted_nodes(
    applier: &mut dyn Applier,
    children: &mut HashMap<NodeId, Vec<NodeId>>,
    reference: &MovableContentStateReference,
) -> Result<(), NodeError> {
    let mut cell = reference.state.borrow_mut();
    let Some(state) = cell.as_mut() else {
        return Ok(());
    };
    let ids: Vec<NodeId> = (0..state.table.groups_size())
        .filter_map(|index| state.table.record(index).node())
        .collect();
    for id in ids {
        let node = applier.detach(id)?;
        children.remove(&id);
        state.nodes.push((id, node));
    }
    Ok(())
}
