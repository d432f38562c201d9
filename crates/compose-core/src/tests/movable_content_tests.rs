use super::*;
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

const LEFT: Key = 1;
const RIGHT: Key = 2;
const SIBLING: Key = 3;
const CONTENT_NODE: Key = 4;
const HOLDER: Key = 5;

struct Logged {
    name: &'static str,
    log: Log,
}

impl RememberObserver for Logged {
    fn on_remembered(&self) {
        self.log.borrow_mut().push(format!("remembered {}", self.name));
    }

    fn on_forgotten(&self) {
        self.log.borrow_mut().push(format!("forgotten {}", self.name));
    }

    fn on_abandoned(&self) {
        self.log.borrow_mut().push(format!("abandoned {}", self.name));
    }
}

struct Leaf {
    name: i32,
    log: Log,
}

impl Node for Leaf {
    fn on_release(&mut self) {
        self.log.borrow_mut().push(format!("release {}", self.name));
    }
}

/// Memory applier that records structural edits.
#[derive(Default)]
struct RecordingApplier {
    inner: MemoryApplier,
    ops: Log,
}

impl Applier for RecordingApplier {
    fn root(&self) -> NodeId {
        self.inner.root()
    }

    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        self.inner.create(id, node)
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError> {
        self.inner.get_mut(id)
    }

    fn insert(&mut self, parent: NodeId, index: usize, child: NodeId) -> Result<(), NodeError> {
        self.ops.borrow_mut().push(format!("insert {child}"));
        self.inner.insert(parent, index, child)
    }

    fn remove(&mut self, parent: NodeId, index: usize, count: usize) -> Result<(), NodeError> {
        self.ops.borrow_mut().push(format!("remove {index}"));
        self.inner.remove(parent, index, count)
    }

    fn move_children(&mut self, parent: NodeId, from: usize, to: usize, count: usize) -> Result<(), NodeError> {
        self.inner.move_children(parent, from, to, count)
    }

    fn release(&mut self, id: NodeId) -> Result<(), NodeError> {
        self.inner.release(id)
    }

    fn detach(&mut self, id: NodeId) -> Result<Box<dyn Node>, NodeError> {
        self.inner.detach(id)
    }

    fn clear(&mut self) {
        self.inner.clear();
    }
}

/// Content remembering an observer and emitting one leaf.
fn tracked_content(log: &Log) -> MovableContent {
    let log = log.clone();
    movable_content_of(move |composer| {
        let remembered = log.clone();
        composer.remember_observer(|| Logged {
            name: "m",
            log: remembered,
        });
        let log = log.clone();
        composer.node(CONTENT_NODE, move || Leaf { name: 7, log }, |_| {});
    })
}

fn leaves(applier: &mut MemoryApplier) -> Vec<(NodeId, i32)> {
    let root = applier.root();
    applier
        .children(root)
        .into_iter()
        .map(|id| (id, applier.with_node::<Leaf, _>(id, |leaf| leaf.name).unwrap()))
        .collect()
}

#[test]
fn moving_within_a_composition_keeps_state_and_nodes() {
    let recomposer = Recomposer::default();
    let composition = recomposer.composition(RecordingApplier::default());
    let left = recomposer.mutable_state_of(true);
    let log: Log = Rc::default();
    let content = tracked_content(&log);
    composition
        .set_content({
            let (left, log) = (left.clone(), log.clone());
            move |composer| {
                let (left, log, content) = (left.clone(), log.clone(), content.clone());
                composer.composable(HOLDER, (), move |composer, _| {
                    let on_left = left.get();
                    composer.group(LEFT, |composer| {
                        if on_left {
                            composer.movable_content(&content);
                        }
                    });
                    let log = log.clone();
                    composer.node(SIBLING, move || Leaf { name: 2, log }, |_| {});
                    composer.group(RIGHT, |composer| {
                        if !on_left {
                            composer.movable_content(&content);
                        }
                    });
                });
            }
        })
        .unwrap();
    let before = composition.with_applier(|applier| leaves(&mut applier.inner));
    assert_eq!(before.iter().map(|(_, name)| *name).collect::<Vec<_>>(), vec![7, 2]);
    let moved = before[0].0;
    composition.with_applier(|applier| applier.ops.borrow_mut().clear());

    left.set(false);
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    let after = composition.with_applier(|applier| leaves(&mut applier.inner));
    assert_eq!(after, vec![(before[1].0, 2), (moved, 7)]);
    assert_eq!(*log.borrow(), vec!["remembered m"]);

    let ops = composition.with_applier(|applier| applier.ops.borrow().clone());
    let removed = ops.iter().position(|op| op == "remove 0");
    let inserted = ops.iter().rposition(|op| *op == format!("insert {moved}"));
    assert!(matches!((removed, inserted), (Some(removed), Some(inserted)) if removed < inserted));
    composition.verify_consistent();

    left.set(true);
    recomposer.run_recompose_and_apply_changes().unwrap();
    let back = composition.with_applier(|applier| leaves(&mut applier.inner));
    assert_eq!(back, before);
    assert_eq!(*log.borrow(), vec!["remembered m"]);
}

#[test]
fn moving_between_compositions_keeps_state() {
    let recomposer = Recomposer::default();
    let first = recomposer.composition(MemoryApplier::new());
    let second = recomposer.composition(MemoryApplier::new());
    let in_first = recomposer.mutable_state_of(true);
    let log: Log = Rc::default();
    let content = tracked_content(&log);
    let host = |show: bool| {
        let (in_first, content) = (in_first.clone(), content.clone());
        move |composer: &mut Composer<'_>| {
            let (in_first, content) = (in_first.clone(), content.clone());
            composer.composable(HOLDER, (), move |composer, _| {
                if in_first.get() == show {
                    composer.movable_content(&content);
                }
            });
        }
    };
    first.set_content(host(true)).unwrap();
    second.set_content(host(false)).unwrap();
    let original = first.with_applier(leaves);
    assert_eq!(original.len(), 1);
    assert!(second.with_applier(|applier| applier.is_empty()));

    in_first.set(false);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert!(first.with_applier(|applier| applier.children(applier.root()).is_empty()));
    let moved = second.with_applier(leaves);
    assert_eq!(moved.iter().map(|(_, name)| *name).collect::<Vec<_>>(), vec![7]);
    assert_eq!(*log.borrow(), vec!["remembered m"]);
    first.verify_consistent();
    second.verify_consistent();

    second.dispose();
    assert_eq!(*log.borrow(), vec!["remembered m", "release 7", "forgotten m"]);
}

#[test]
fn unclaimed_content_is_disposed() {
    let recomposer = Recomposer::default();
    let composition = recomposer.composition(MemoryApplier::new());
    let shown = recomposer.mutable_state_of(true);
    let log: Log = Rc::default();
    let content = tracked_content(&log);
    composition
        .set_content({
            let shown = shown.clone();
            move |composer| {
                let (shown, content) = (shown.clone(), content.clone());
                composer.composable(HOLDER, (), move |composer, _| {
                    if shown.get() {
                        composer.movable_content(&content);
                    }
                });
            }
        })
        .unwrap();
    assert_eq!(composition.with_applier(leaves).len(), 1);

    shown.set(false);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert!(composition.with_applier(|applier| applier.is_empty()));
    assert_eq!(*log.borrow(), vec!["remembered m", "forgotten m", "release 7"]);

    composition.dispose();
    assert_eq!(log.borrow().len(), 3);
}

#[test]
fn content_identity_is_stable_across_clones() {
    let content = movable_content_of(|_| {});
    let other = movable_content_of(|_| {});
    assert_eq!(content.clone(), content);
    assert_ne!(content.id(), other.id());
}
