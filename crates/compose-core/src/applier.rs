use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;

use crate::collections::map::HashMap;

pub type NodeId = usize;

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(1);

/// Node ids are assigned by the composition when it records a node, so a node
/// is addressable before the applier has seen it.
pub fn allocate_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node {id} missing")]
    Missing { id: NodeId },
    #[error("node {id} type mismatch; expected {expected}")]
    TypeMismatch { id: NodeId, expected: &'static str },
    #[error("node {id} already exists")]
    AlreadyExists { id: NodeId },
    #[error("index {index} out of bounds for {len} children of node {parent}")]
    IndexOutOfBounds { parent: NodeId, index: usize, len: usize },
}

/// An element of the retained tree. The lifecycle hooks are delivered by the
/// remember dispatcher after changes have been applied.
pub trait Node: Any {
    fn on_reuse(&mut self) {}
    fn on_deactivate(&mut self) {}
    fn on_release(&mut self) {}
}

impl dyn Node {
    pub fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    pub fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Platform tree mutator driven by the change list.
pub trait Applier {
    fn on_begin_changes(&mut self) {}
    fn on_end_changes(&mut self) {}
    fn root(&self) -> NodeId;
    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError>;
    fn get_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError>;
    fn insert(&mut self, parent: NodeId, index: usize, child: NodeId) -> Result<(), NodeError>;
    fn remove(&mut self, parent: NodeId, index: usize, count: usize) -> Result<(), NodeError>;
    /// Moves `count` children starting at `from` so they start at `to`, where
    /// `to` is counted before the children are taken out.
    fn move_children(&mut self, parent: NodeId, from: usize, to: usize, count: usize) -> Result<(), NodeError>;
    /// Drops a node that is no longer attached anywhere.
    fn release(&mut self, id: NodeId) -> Result<(), NodeError>;
    /// Takes a node out of the tree without releasing it, so it can be
    /// created again elsewhere.
    fn detach(&mut self, id: NodeId) -> Result<Box<dyn Node>, NodeError>;
    fn clear(&mut self);
}

struct RootNode;

impl Node for RootNode {}

struct NodeEntry {
    node: Box<dyn Node>,
    children: Vec<NodeId>,
}

/// Applier that keeps the whole tree in memory.
pub struct MemoryApplier {
    root: NodeId,
    nodes: HashMap<NodeId, NodeEntry>, // FUTURE(no_std): migrate to arena-backed node storage.
    batches: usize,
}

impl Default for MemoryApplier {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApplier {
    pub fn new() -> Self {
        let root = allocate_node_id();
        let mut nodes = HashMap::default();
        nodes.insert(
            root,
            NodeEntry {
                node: Box::new(RootNode),
                children: Vec::new(),
            },
        );
        Self {
            root,
            nodes,
            batches: 0,
        }
    }

    pub fn with_node<N: Node + 'static, R>(&mut self, id: NodeId, f: impl FnOnce(&mut N) -> R) -> Result<R, NodeError> {
        let node = self.get_mut(id)?;
        let typed = node
            .as_any_mut()
            .downcast_mut::<N>()
            .ok_or(NodeError::TypeMismatch {
                id,
                expected: std::any::type_name::<N>(),
            })?;
        Ok(f(typed))
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(&id)
            .map(|entry| entry.children.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Number of nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Completed `on_begin_changes`/`on_end_changes` brackets.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn dump_tree(&self) -> String {
        let mut output = String::new();
        self.dump_node(&mut output, self.root, 0);
        output
    }

    fn dump_node(&self, output: &mut String, id: NodeId, depth: usize) {
        let indent = "  ".repeat(depth);
        match self.nodes.get(&id) {
            Some(entry) => {
                let type_name = std::any::type_name_of_val(&*entry.node);
                output.push_str(&format!("{indent}[{id}] {type_name}\n"));
                for child in &entry.children {
                    self.dump_node(output, *child, depth + 1);
                }
            }
            None => output.push_str(&format!("{indent}[{id}] (missing)\n")),
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut NodeEntry, NodeError> {
        self.nodes.get_mut(&id).ok_or(NodeError::Missing { id })
    }
}

impl Applier for MemoryApplier {
    fn on_end_changes(&mut self) {
        self.batches += 1;
    }

    fn root(&self) -> NodeId {
        self.root
    }

    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        if self.nodes.contains_key(&id) {
            return Err(NodeError::AlreadyExists { id });
        }
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                children: Vec::new(),
            },
        );
        Ok(())
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError> {
        Ok(self.entry_mut(id)?.node.as_mut())
    }

    fn insert(&mut self, parent: NodeId, index: usize, child: NodeId) -> Result<(), NodeError> {
        if !self.nodes.contains_key(&child) {
            return Err(NodeError::Missing { id: child });
        }
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if index > len {
            return Err(NodeError::IndexOutOfBounds { parent, index, len });
        }
        entry.children.insert(index, child);
        Ok(())
    }

    fn remove(&mut self, parent: NodeId, index: usize, count: usize) -> Result<(), NodeError> {
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if index + count > len {
            return Err(NodeError::IndexOutOfBounds { parent, index: index + count, len });
        }
        entry.children.drain(index..index + count);
        Ok(())
    }

    fn move_children(&mut self, parent: NodeId, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        let entry = self.entry_mut(parent)?;
        let len = entry.children.len();
        if from + count > len || to > len {
            return Err(NodeError::IndexOutOfBounds { parent, index: from.max(to), len });
        }
        let moved: Vec<NodeId> = entry.children.drain(from..from + count).collect();
        let destination = if to > from { to - count } else { to };
        for (offset, id) in moved.into_iter().enumerate() {
            entry.children.insert(destination + offset, id);
        }
        Ok(())
    }

    fn release(&mut self, id: NodeId) -> Result<(), NodeError> {
        self.nodes.remove(&id).map(|_| ()).ok_or(NodeError::Missing { id })
    }

    fn detach(&mut self, id: NodeId) -> Result<Box<dyn Node>, NodeError> {
        if id == self.root {
            return Err(NodeError::Missing { id });
        }
        self.nodes
            .remove(&id)
            .map(|entry| entry.node)
            .ok_or(NodeError::Missing { id })
    }

    fn clear(&mut self) {
        let root = self.root;
        self.nodes.retain(|id, _| *id == root);
        if let Some(entry) = self.nodes.get_mut(&root) {
            entry.children.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leaf(&'static str);

    impl Node for Leaf {}

    fn leaf(applier: &mut MemoryApplier, name: &'static str) -> NodeId {
        let id = allocate_node_id();
        applier.create(id, Box::new(Leaf(name))).unwrap();
        id
    }

    #[test]
    fn move_children_uses_pre_removal_destination() {
        let mut applier = MemoryApplier::new();
        let root = applier.root();
        let ids: Vec<_> = ["a", "b", "c"].iter().map(|name| leaf(&mut applier, name)).collect();
        for (index, id) in ids.iter().enumerate() {
            applier.insert(root, index, *id).unwrap();
        }
        applier.move_children(root, 0, 2, 1).unwrap();
        assert_eq!(applier.children(root), vec![ids[1], ids[0], ids[2]]);
        applier.move_children(root, 2, 0, 1).unwrap();
        assert_eq!(applier.children(root), vec![ids[2], ids[1], ids[0]]);
    }

    #[test]
    fn with_node_reports_type_mismatch() {
        let mut applier = MemoryApplier::new();
        let id = leaf(&mut applier, "a");
        let name = applier.with_node::<Leaf, _>(id, |leaf| leaf.0).unwrap();
        assert_eq!(name, "a");
        let error = applier.with_node::<RootNode, _>(id, |_| ()).unwrap_err();
        assert!(matches!(error, NodeError::TypeMismatch { .. }));
    }

    #[test]
    fn detached_nodes_can_be_created_again() {
        let mut applier = MemoryApplier::new();
        let id = leaf(&mut applier, "moved");
        let node = applier.detach(id).unwrap();
        assert!(!applier.contains(id));
        applier.create(id, node).unwrap();
        assert_eq!(applier.with_node::<Leaf, _>(id, |leaf| leaf.0).unwrap(), "moved");
        let root = applier.root();
        assert!(applier.detach(root).is_err());
    }

    #[test]
    fn clear_keeps_only_the_root() {
        let mut applier = MemoryApplier::new();
        let root = applier.root();
        let id = leaf(&mut applier, "a");
        applier.insert(root, 0, id).unwrap();
        applier.clear();
        assert!(applier.is_empty());
        assert!(applier.children(root).is_empty());
        assert!(!applier.contains(id));
    }
}
