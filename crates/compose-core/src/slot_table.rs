//! Persistent record of composition output.
//!
//! Groups are stored depth-first in a gap buffer. Each group knows the size of
//! its subtree, so parent, sibling and child addresses are derived from
//! traversal order rather than stored. Anchors are stable handles to a group
//! that survive structural edits elsewhere in the table, including a move of
//! the group into another table.
//!
//! Access happens through sessions: any number of [`SlotReader`]s, or a
//! single [`SlotWriter`]. Overlapping sessions are programming errors and
//! panic immediately.

use std::any::Any;
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::rc::Rc;

use crate::applier::NodeId;
use crate::recompose_scope::RecomposeScope;
use crate::remember::ObserverHolder;

pub type Key = u64;

pub(crate) const ROOT_KEY: Key = 100;
pub(crate) const MOVABLE_CONTENT_KEY: Key = 126;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupKind {
    Root,
    Plain,
    Restart,
    Keyed,
    Node,
    Movable,
}

/// Payload stored in a group.
#[derive(Clone)]
pub enum Slot {
    Empty,
    Value(Rc<dyn Any>),
    Remembered(ObserverHolder),
    Scope(RecomposeScope),
    Node(NodeId),
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Empty => f.write_str("Empty"),
            Slot::Value(_) => f.write_str("Value(..)"),
            Slot::Remembered(_) => f.write_str("Remembered(..)"),
            Slot::Scope(scope) => write!(f, "Scope({})", scope.id()),
            Slot::Node(id) => write!(f, "Node({id})"),
        }
    }
}

const INVALID_LOCATION: isize = isize::MIN;

struct AnchorCell {
    // Non-negative: index before the gap. Negative: distance from the end.
    location: Cell<isize>,
}

/// Stable handle to a group.
#[derive(Clone)]
pub struct Anchor(Rc<AnchorCell>);

impl Anchor {
    fn new(location: isize) -> Self {
        Self(Rc::new(AnchorCell {
            location: Cell::new(location),
        }))
    }

    pub fn valid(&self) -> bool {
        self.0.location.get() != INVALID_LOCATION
    }

    pub(crate) fn invalidate(&self) {
        self.0.location.set(INVALID_LOCATION);
    }

    pub fn ptr_eq(&self, other: &Anchor) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Index of the anchored group in `table`, if the table owns it.
    pub fn to_index(&self, table: &SlotTable) -> Option<usize> {
        table.anchor_index(self)
    }
}

impl PartialEq for Anchor {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Anchor {}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "Anchor({})", self.0.location.get())
        } else {
            f.write_str("Anchor(invalid)")
        }
    }
}

pub(crate) trait Relocate {
    fn relocate(&self, location: isize);
}

/// Two-stack gap buffer. `back` is stored reversed so that its last element
/// is the first element after the gap.
pub(crate) struct GapBuffer<T> {
    front: Vec<T>,
    back: Vec<T>,
}

impl<T: Relocate> GapBuffer<T> {
    pub(crate) fn new() -> Self {
        Self {
            front: Vec::new(),
            back: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.front.len() + self.back.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        if index < self.front.len() {
            return self.front.get(index);
        }
        let offset = index - self.front.len();
        if offset < self.back.len() {
            self.back.get(self.back.len() - 1 - offset)
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index < self.front.len() {
            return self.front.get_mut(index);
        }
        let offset = index - self.front.len();
        let back_len = self.back.len();
        if offset < back_len {
            self.back.get_mut(back_len - 1 - offset)
        } else {
            None
        }
    }

    fn move_gap(&mut self, index: usize) {
        let len = self.len() as isize;
        while self.front.len() > index {
            let Some(item) = self.front.pop() else { break };
            item.relocate(self.front.len() as isize - len);
            self.back.push(item);
        }
        while self.front.len() < index {
            let Some(item) = self.back.pop() else { break };
            item.relocate(self.front.len() as isize);
            self.front.push(item);
        }
    }

    pub(crate) fn insert(&mut self, index: usize, items: impl IntoIterator<Item = T>) {
        self.move_gap(index);
        for item in items {
            item.relocate(self.front.len() as isize);
            self.front.push(item);
        }
    }

    pub(crate) fn remove(&mut self, index: usize, count: usize) -> Vec<T> {
        self.move_gap(index);
        let mut removed = Vec::with_capacity(count);
        for _ in 0..count {
            match self.back.pop() {
                Some(item) => removed.push(item),
                None => break,
            }
        }
        removed
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.front.iter().chain(self.back.iter().rev())
    }
}

pub(crate) struct GroupRecord {
    pub(crate) key: Key,
    pub(crate) data_key: Option<Key>,
    pub(crate) kind: GroupKind,
    pub(crate) size: usize,
    pub(crate) anchor: OnceCell<Anchor>,
    pub(crate) slots: Vec<Slot>,
}

impl GroupRecord {
    pub(crate) fn new(key: Key, data_key: Option<Key>, kind: GroupKind) -> Self {
        Self {
            key,
            data_key,
            kind,
            size: 1,
            anchor: OnceCell::new(),
            slots: Vec::new(),
        }
    }

    pub(crate) fn anchor(&self) -> Anchor {
        // A fresh anchor is relocated the next time the record moves.
        self.anchor.get_or_init(|| Anchor::new(INVALID_LOCATION)).clone()
    }

    pub(crate) fn node(&self) -> Option<NodeId> {
        if self.kind != GroupKind::Node {
            return None;
        }
        match self.slots.first() {
            Some(Slot::Node(id)) => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn scope(&self) -> Option<&RecomposeScope> {
        self.slots.iter().find_map(|slot| match slot {
            Slot::Scope(scope) => Some(scope),
            _ => None,
        })
    }
}

impl Relocate for GroupRecord {
    fn relocate(&self, location: isize) {
        if let Some(anchor) = self.anchor.get() {
            anchor.0.location.set(location);
        }
    }
}

pub struct SlotTable {
    groups: GapBuffer<GroupRecord>,
    readers: Cell<usize>,
    writer: Cell<bool>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            groups: GapBuffer::new(),
            readers: Cell::new(0),
            writer: Cell::new(false),
        }
    }

    pub(crate) fn with_root() -> Self {
        Self::from_records(vec![GroupRecord::new(ROOT_KEY, None, GroupKind::Root)])
    }

    pub(crate) fn from_records(records: Vec<GroupRecord>) -> Self {
        let mut table = Self::new();
        table.groups.insert(0, records);
        table
    }

    pub fn groups_size(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.len() == 0
    }

    pub fn open_reader(&self) -> SlotReader<'_> {
        if self.writer.get() {
            panic!("cannot read the slot table while a writer is active");
        }
        self.readers.set(self.readers.get() + 1);
        SlotReader { table: self }
    }

    pub fn open_writer(&mut self) -> SlotWriter<'_> {
        if self.writer.get() {
            panic!("cannot start a writer while another writer is active");
        }
        if self.readers.get() > 0 {
            panic!("cannot start a writer while {} reader(s) are active", self.readers.get());
        }
        self.writer.set(true);
        SlotWriter { table: self }
    }

    pub fn read<R>(&self, f: impl FnOnce(&SlotReader<'_>) -> R) -> R {
        let reader = self.open_reader();
        f(&reader)
    }

    pub fn write<R>(&mut self, f: impl FnOnce(&mut SlotWriter<'_>) -> R) -> R {
        let mut writer = self.open_writer();
        f(&mut writer)
    }

    pub(crate) fn record(&self, index: usize) -> &GroupRecord {
        match self.groups.get(index) {
            Some(record) => record,
            None => panic!("group index {index} out of range ({})", self.groups.len()),
        }
    }

    fn record_mut(&mut self, index: usize) -> &mut GroupRecord {
        let len = self.groups.len();
        match self.groups.get_mut(index) {
            Some(record) => record,
            None => panic!("group index {index} out of range ({len})"),
        }
    }

    pub(crate) fn anchor_index(&self, anchor: &Anchor) -> Option<usize> {
        if !anchor.valid() {
            return None;
        }
        let location = anchor.0.location.get();
        let index = if location >= 0 {
            location as usize
        } else {
            let resolved = self.groups.len() as isize + location;
            if resolved < 0 {
                return None;
            }
            resolved as usize
        };
        let record = self.groups.get(index)?;
        match record.anchor.get() {
            Some(own) if own.ptr_eq(anchor) => Some(index),
            _ => None,
        }
    }

    pub fn owns_anchor(&self, anchor: &Anchor) -> bool {
        self.anchor_index(anchor).is_some()
    }

    pub fn group_contains_anchor(&self, group: usize, anchor: &Anchor) -> bool {
        match self.anchor_index(anchor) {
            Some(index) => index >= group && index < group + self.record(group).size,
            None => false,
        }
    }

    pub(crate) fn anchor_at(&self, index: usize) -> Anchor {
        let record = self.record(index);
        let fresh = record.anchor.get().is_none();
        let anchor = record.anchor();
        if fresh {
            let location = if index < self.groups.front.len() {
                index as isize
            } else {
                index as isize - self.groups.len() as isize
            };
            anchor.0.location.set(location);
        }
        anchor
    }

    pub(crate) fn children(&self, index: usize) -> Children<'_> {
        let record = self.record(index);
        Children {
            table: self,
            next: index + 1,
            end: index + record.size,
        }
    }

    fn top_level(&self) -> Children<'_> {
        Children {
            table: self,
            next: 0,
            end: self.groups.len(),
        }
    }

    /// Indices of the groups enclosing `index`, outermost first.
    pub(crate) fn ancestors(&self, index: usize) -> Vec<usize> {
        let mut chain = Vec::new();
        let mut cursor = 0;
        let mut end = self.groups.len();
        while cursor < end {
            let size = self.record(cursor).size;
            if index >= cursor && index < cursor + size {
                if cursor == index {
                    break;
                }
                chain.push(cursor);
                end = cursor + size;
                cursor += 1;
            } else {
                cursor += size;
            }
        }
        chain
    }

    pub(crate) fn parent(&self, index: usize) -> Option<usize> {
        self.ancestors(index).last().copied()
    }

    /// Nodes that are direct children, in tree terms, of `index`: node
    /// groups nested below it without another node group in between.
    pub(crate) fn child_nodes(&self, index: usize) -> Vec<NodeId> {
        let mut nodes = Vec::new();
        self.collect_child_nodes(index, &mut nodes);
        nodes
    }

    fn collect_child_nodes(&self, index: usize, nodes: &mut Vec<NodeId>) {
        for child in self.children(index) {
            let record = self.record(child);
            match record.node() {
                Some(id) => nodes.push(id),
                None => self.collect_child_nodes(child, nodes),
            }
        }
    }

    /// Anchors of every group carrying `key`, in document order.
    pub fn report_groups_with_key(&self, key: Key) -> Vec<Anchor> {
        (0..self.groups.len())
            .filter(|index| self.record(*index).key == key)
            .map(|index| self.anchor_at(index))
            .collect()
    }

    pub(crate) fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.groups.iter().flat_map(|record| record.slots.iter())
    }

    /// Panics if the depth-first layout or any anchor is inconsistent.
    pub fn verify_well_formed(&self) {
        let len = self.groups.len();
        let mut index = 0;
        while index < len {
            index = self.verify_group(index, len);
        }
        for index in 0..len {
            if let Some(anchor) = self.record(index).anchor.get() {
                if anchor.valid() && self.anchor_index(anchor) != Some(index) {
                    panic!("anchor of group {index} resolves to {:?}", self.anchor_index(anchor));
                }
            }
        }
    }

    fn verify_group(&self, index: usize, parent_end: usize) -> usize {
        let size = self.record(index).size;
        let end = index + size;
        if size == 0 || end > parent_end {
            panic!("group {index} of size {size} overruns its parent ending at {parent_end}");
        }
        let mut child = index + 1;
        while child < end {
            child = self.verify_group(child, end);
        }
        if child != end {
            panic!("children of group {index} end at {child}, expected {end}");
        }
        end
    }

    pub(crate) fn take_records(&mut self) -> Vec<GroupRecord> {
        let len = self.groups.len();
        self.groups.remove(0, len)
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn dump(table: &SlotTable, f: &mut fmt::Formatter<'_>, index: usize, depth: usize) -> fmt::Result {
            let record = table.record(index);
            writeln!(
                f,
                "{}{:?} key={} data={:?} slots={:?}",
                "  ".repeat(depth),
                record.kind,
                record.key,
                record.data_key,
                record.slots
            )?;
            for child in table.children(index) {
                dump(table, f, child, depth + 1)?;
            }
            Ok(())
        }
        for top in self.top_level() {
            dump(self, f, top, 0)?;
        }
        Ok(())
    }
}

pub(crate) struct Children<'a> {
    table: &'a SlotTable,
    next: usize,
    end: usize,
}

impl Iterator for Children<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next >= self.end {
            return None;
        }
        let current = self.next;
        self.next += self.table.record(current).size;
        Some(current)
    }
}

pub struct SlotReader<'a> {
    table: &'a SlotTable,
}

impl<'a> SlotReader<'a> {
    pub fn table(&self) -> &'a SlotTable {
        self.table
    }

    pub fn groups_size(&self) -> usize {
        self.table.groups_size()
    }

    pub fn key(&self, index: usize) -> Key {
        self.table.record(index).key
    }

    pub fn data_key(&self, index: usize) -> Option<Key> {
        self.table.record(index).data_key
    }

    pub fn kind(&self, index: usize) -> GroupKind {
        self.table.record(index).kind
    }

    pub fn group_size(&self, index: usize) -> usize {
        self.table.record(index).size
    }

    pub fn slots(&self, index: usize) -> &'a [Slot] {
        &self.table.record(index).slots
    }

    pub fn slot(&self, index: usize, slot: usize) -> Option<&'a Slot> {
        self.table.record(index).slots.get(slot)
    }

    pub fn node(&self, index: usize) -> Option<NodeId> {
        self.table.record(index).node()
    }

    pub fn scope(&self, index: usize) -> Option<&'a RecomposeScope> {
        self.table.record(index).scope()
    }

    pub fn anchor(&self, index: usize) -> Anchor {
        self.table.anchor_at(index)
    }

    pub fn children(&self, index: usize) -> Vec<usize> {
        self.table.children(index).collect()
    }

    pub fn ancestors(&self, index: usize) -> Vec<usize> {
        self.table.ancestors(index)
    }

    pub fn child_nodes(&self, index: usize) -> Vec<NodeId> {
        self.table.child_nodes(index)
    }
}

impl Drop for SlotReader<'_> {
    fn drop(&mut self) {
        self.table.readers.set(self.table.readers.get() - 1);
    }
}

pub struct SlotWriter<'a> {
    table: &'a mut SlotTable,
}

impl SlotWriter<'_> {
    pub fn table(&self) -> &SlotTable {
        self.table
    }

    fn resolve(&self, anchor: &Anchor) -> usize {
        match self.table.anchor_index(anchor) {
            Some(index) => index,
            None => panic!("{anchor:?} is not owned by this slot table"),
        }
    }

    fn insertion_index(&self, parent: usize, position: usize) -> usize {
        let mut children = self.table.children(parent);
        for _ in 0..position {
            if children.next().is_none() {
                break;
            }
        }
        children.next().unwrap_or(parent + self.table.record(parent).size)
    }

    fn resize_enclosing(&mut self, parent: usize, delta: isize) {
        let mut chain = self.table.ancestors(parent);
        chain.push(parent);
        for index in chain {
            let record = self.table.record_mut(index);
            record.size = (record.size as isize + delta) as usize;
        }
    }

    /// Inserts a complete subtree as child `position` of `parent`. Returns the
    /// index of the inserted group.
    pub(crate) fn insert_records(&mut self, parent: usize, position: usize, records: Vec<GroupRecord>) -> usize {
        let count = records.len();
        if count == 0 {
            return self.insertion_index(parent, position);
        }
        debug_assert_eq!(records[0].size, count, "inserted records must form one subtree");
        let index = self.insertion_index(parent, position);
        self.resize_enclosing(parent, count as isize);
        self.table.groups.insert(index, records);
        index
    }

    pub(crate) fn insert_group(&mut self, parent: &Anchor, position: usize, records: Vec<GroupRecord>) -> usize {
        let parent = self.resolve(parent);
        self.insert_records(parent, position, records)
    }

    /// Detaches the subtree at `index`. The anchors of the returned records
    /// stay attached to them and relocate when the records are inserted again.
    pub(crate) fn detach_group(&mut self, index: usize) -> Vec<GroupRecord> {
        let size = self.table.record(index).size;
        if let Some(parent) = self.table.parent(index) {
            self.resize_enclosing(parent, -(size as isize));
        }
        self.table.groups.remove(index, size)
    }

    pub(crate) fn remove_group_at(&mut self, index: usize) -> Vec<GroupRecord> {
        let removed = self.detach_group(index);
        for record in &removed {
            if let Some(anchor) = record.anchor.get() {
                anchor.invalidate();
            }
        }
        removed
    }

    pub(crate) fn remove_group(&mut self, anchor: &Anchor) -> Vec<GroupRecord> {
        let index = self.resolve(anchor);
        self.remove_group_at(index)
    }

    /// Moves the anchored group to child `position` of `parent`, where the
    /// position is counted after the group has been taken out.
    pub(crate) fn move_group(&mut self, anchor: &Anchor, parent: &Anchor, position: usize) -> usize {
        let index = self.resolve(anchor);
        let records = self.detach_group(index);
        let parent = self.resolve(parent);
        self.insert_records(parent, position, records)
    }

    pub(crate) fn position_in_parent(&self, index: usize) -> Option<usize> {
        let parent = self.table.parent(index)?;
        self.table.children(parent).position(|child| child == index)
    }

    pub fn index_of(&self, anchor: &Anchor) -> Option<usize> {
        self.table.anchor_index(anchor)
    }

    pub fn anchor(&self, index: usize) -> Anchor {
        self.table.anchor_at(index)
    }

    pub(crate) fn record(&self, index: usize) -> &GroupRecord {
        self.table.record(index)
    }

    pub(crate) fn set_slot(&mut self, index: usize, slot: usize, value: Slot) -> Slot {
        let slots = &mut self.table.record_mut(index).slots;
        if slots.len() <= slot {
            slots.resize(slot + 1, Slot::Empty);
        }
        std::mem::replace(&mut slots[slot], value)
    }

    pub(crate) fn trim_slots(&mut self, index: usize, len: usize) -> Vec<Slot> {
        let slots = &mut self.table.record_mut(index).slots;
        if slots.len() <= len {
            return Vec::new();
        }
        slots.split_off(len)
    }

    pub(crate) fn slots_mut(&mut self, index: usize) -> &mut Vec<Slot> {
        &mut self.table.record_mut(index).slots
    }

    pub fn groups_size(&self) -> usize {
        self.table.groups_size()
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        self.table.writer.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf(key: Key) -> Vec<GroupRecord> {
        vec![GroupRecord::new(key, None, GroupKind::Plain)]
    }

    fn keys_of_children(table: &SlotTable, parent: usize) -> Vec<Key> {
        table.read(|reader| {
            reader
                .children(parent)
                .into_iter()
                .map(|child| reader.key(child))
                .collect()
        })
    }

    #[test]
    fn insert_keeps_children_in_position_order() {
        let mut table = SlotTable::with_root();
        table.write(|writer| {
            writer.insert_records(0, 0, leaf(1));
            writer.insert_records(0, 1, leaf(3));
            writer.insert_records(0, 1, leaf(2));
        });
        assert_eq!(keys_of_children(&table, 0), vec![1, 2, 3]);
        assert_eq!(table.record(0).size, 4);
        table.verify_well_formed();
    }

    #[test]
    fn anchors_survive_edits_before_them() {
        let mut table = SlotTable::with_root();
        let anchor = table.write(|writer| {
            let index = writer.insert_records(0, 0, leaf(7));
            writer.anchor(index)
        });
        table.write(|writer| {
            writer.insert_records(0, 0, leaf(1));
            writer.insert_records(0, 0, leaf(2));
        });
        let index = anchor.to_index(&table).expect("anchor resolves");
        assert_eq!(table.record(index).key, 7);
        assert_eq!(index, 3);
    }

    #[test]
    fn removed_groups_invalidate_their_anchors() {
        let mut table = SlotTable::with_root();
        let (outer, inner) = table.write(|writer| {
            let mut records = leaf(1);
            records[0].size = 2;
            records.push(GroupRecord::new(2, None, GroupKind::Plain));
            let index = writer.insert_records(0, 0, records);
            (writer.anchor(index), writer.anchor(index + 1))
        });
        table.write(|writer| {
            writer.remove_group(&outer);
        });
        assert!(!outer.valid());
        assert!(!inner.valid());
        assert_eq!(table.groups_size(), 1);
        assert!(!table.owns_anchor(&inner));
    }

    #[test]
    fn move_group_reorders_and_keeps_anchor() {
        let mut table = SlotTable::with_root();
        let root = table.anchor_at(0);
        let third = table.write(|writer| {
            writer.insert_records(0, 0, leaf(1));
            writer.insert_records(0, 1, leaf(2));
            let index = writer.insert_records(0, 2, leaf(3));
            writer.anchor(index)
        });
        table.write(|writer| {
            writer.move_group(&third, &root, 0);
        });
        assert_eq!(keys_of_children(&table, 0), vec![3, 1, 2]);
        assert_eq!(third.to_index(&table), Some(1));
        table.verify_well_formed();
    }

    #[test]
    fn records_moved_between_tables_keep_anchor_identity() {
        let mut source = SlotTable::with_root();
        let anchor = source.write(|writer| {
            let index = writer.insert_records(0, 0, leaf(9));
            writer.anchor(index)
        });
        let records = source.write(|writer| {
            let index = writer.index_of(&anchor).expect("owned");
            writer.detach_group(index)
        });
        let moved = SlotTable::from_records(records);
        assert!(!source.owns_anchor(&anchor));
        assert_eq!(anchor.to_index(&moved), Some(0));
    }

    #[test]
    fn report_groups_with_key_finds_nested_groups() {
        let mut table = SlotTable::with_root();
        table.write(|writer| {
            let mut records = leaf(5);
            records[0].size = 2;
            records.push(GroupRecord::new(42, None, GroupKind::Plain));
            writer.insert_records(0, 0, records);
            writer.insert_records(0, 1, leaf(42));
        });
        let found = table.report_groups_with_key(42);
        let indices: Vec<_> = found.iter().filter_map(|a| a.to_index(&table)).collect();
        assert_eq!(indices, vec![2, 3]);
    }

    #[test]
    #[should_panic(expected = "reader(s) are active")]
    fn writer_cannot_overlap_a_leaked_reader() {
        let mut table = SlotTable::with_root();
        std::mem::forget(table.open_reader());
        let _writer = table.open_writer();
    }

    #[derive(Clone, Debug)]
    enum Edit {
        Insert { parent: usize, position: usize, key: Key },
        Remove { group: usize },
        Move { group: usize, parent: usize, position: usize },
    }

    fn edit() -> impl Strategy<Value = Edit> {
        prop_oneof![
            (any::<usize>(), 0usize..4, 0u64..8)
                .prop_map(|(parent, position, key)| Edit::Insert { parent, position, key }),
            any::<usize>().prop_map(|group| Edit::Remove { group }),
            (any::<usize>(), any::<usize>(), 0usize..4)
                .prop_map(|(group, parent, position)| Edit::Move { group, parent, position }),
        ]
    }

    proptest! {
        #[test]
        fn random_edits_keep_the_table_well_formed(edits in prop::collection::vec(edit(), 0..48)) {
            let mut table = SlotTable::with_root();
            let mut anchors: Vec<(Anchor, Key)> = Vec::new();
            for edit in edits {
                let len = table.groups_size();
                match edit {
                    Edit::Insert { parent, position, key } => {
                        let parent = parent % len;
                        let anchor = table.write(|writer| {
                            let index = writer.insert_records(parent, position, leaf(key));
                            writer.anchor(index)
                        });
                        anchors.push((anchor, key));
                    }
                    Edit::Remove { group } => {
                        if len > 1 {
                            let group = 1 + group % (len - 1);
                            table.write(|writer| {
                                writer.remove_group_at(group);
                            });
                        }
                    }
                    Edit::Move { group, parent, position } => {
                        if len > 1 {
                            let group = 1 + group % (len - 1);
                            let size = table.record(group).size;
                            let parent = parent % len;
                            let inside = parent >= group && parent < group + size;
                            if !inside {
                                let group_anchor = table.anchor_at(group);
                                let parent_anchor = table.anchor_at(parent);
                                table.write(|writer| {
                                    writer.move_group(&group_anchor, &parent_anchor, position);
                                });
                            }
                        }
                    }
                }
                table.verify_well_formed();
            }
            for (anchor, key) in anchors {
                if let Some(index) = anchor.to_index(&table) {
                    prop_assert_eq!(table.record(index).key, key);
                } else {
                    prop_assert!(!anchor.valid());
                }
            }
        }
    }
}
