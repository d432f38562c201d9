use super::*;
use crate::call_site_key;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>; // FUTURE(no_std): replace Vec with ring buffer for testing.

struct Logged {
    name: &'static str,
    log: Log,
}

impl Logged {
    fn new(name: &'static str, log: &Log) -> Self {
        Self { name, log: log.clone() }
    }
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
    log: Option<Log>,
}

impl Leaf {
    fn new(name: i32) -> Self {
        Self { name, log: None }
    }

    fn logged(name: i32, log: &Log) -> Self {
        Self {
            name,
            log: Some(log.clone()),
        }
    }

    fn record(&self, event: &str) {
        if let Some(log) = &self.log {
            log.borrow_mut().push(format!("{event} {}", self.name));
        }
    }
}

impl Node for Leaf {
    fn on_reuse(&mut self) {
        self.record("reuse");
    }

    fn on_deactivate(&mut self) {
        self.record("deactivate");
    }

    fn on_release(&mut self) {
        self.record("release");
    }
}

/// Memory applier whose node creation can be made to fail.
struct FailingApplier {
    inner: MemoryApplier,
    fail: Rc<Cell<bool>>,
}

impl Applier for FailingApplier {
    fn root(&self) -> NodeId {
        self.inner.root()
    }

    fn create(&mut self, id: NodeId, node: Box<dyn Node>) -> Result<(), NodeError> {
        if self.fail.get() {
            return Err(NodeError::Missing { id });
        }
        self.inner.create(id, node)
    }

    fn get_mut(&mut self, id: NodeId) -> Result<&mut dyn Node, NodeError> {
        self.inner.get_mut(id)
    }

    fn insert(&mut self, parent: NodeId, index: usize, child: NodeId) -> Result<(), NodeError> {
        self.inner.insert(parent, index, child)
    }

    fn remove(&mut self, parent: NodeId, index: usize, count: usize) -> Result<(), NodeError> {
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

fn setup() -> (Recomposer, Composition<MemoryApplier>) {
    let recomposer = Recomposer::default();
    let composition = recomposer.composition(MemoryApplier::new());
    (recomposer, composition)
}

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

fn bump(count: &Cell<usize>) {
    count.set(count.get() + 1);
}

fn root_children(composition: &Composition<MemoryApplier>) -> Vec<NodeId> {
    composition.with_applier(|applier| {
        let root = applier.root();
        applier.children(root)
    })
}

fn leaf_names(composition: &Composition<MemoryApplier>) -> Vec<i32> {
    composition.with_applier(|applier| {
        let root = applier.root();
        applier
            .children(root)
            .into_iter()
            .map(|id| applier.with_node::<Leaf, _>(id, |leaf| leaf.name).unwrap())
            .collect()
    })
}

#[test]
fn writing_read_state_recomposes_the_scope_once() {
    let (recomposer, composition) = setup();
    let x = recomposer.mutable_state_of(0);
    let runs = counter();
    let seen = Rc::new(Cell::new(-1));
    composition
        .set_content({
            let (x, runs, seen) = (x.clone(), runs.clone(), seen.clone());
            move |composer| {
                let (x, runs, seen) = (x.clone(), runs.clone(), seen.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&runs);
                    seen.set(x.get());
                });
            }
        })
        .unwrap();
    assert_eq!(runs.get(), 1);
    assert!(!composition.has_invalidations());
    assert!(!composition.recompose());

    x.set(1);
    assert!(composition.has_invalidations());
    assert!(recomposer.needs_frame());
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 2);
    assert_eq!(seen.get(), 1);
    assert!(!composition.has_invalidations());
    composition.verify_consistent();

    assert!(!recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 2);
}

#[test]
fn writes_inside_a_pass_invalidate_each_reader_once() {
    let (recomposer, composition) = setup();
    let trigger = recomposer.mutable_state_of(0);
    let y = recomposer.mutable_state_of(0);
    let (a_runs, b_runs) = (counter(), counter());
    composition
        .set_content({
            let (trigger, y, a_runs, b_runs) = (trigger.clone(), y.clone(), a_runs.clone(), b_runs.clone());
            move |composer| {
                let (trigger, writes) = (trigger.clone(), y.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    let value = trigger.get();
                    if value > 0 {
                        writes.set(value);
                    }
                });
                let (y_a, a_runs) = (y.clone(), a_runs.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&a_runs);
                    y_a.get();
                });
                let (y_b, b_runs) = (y.clone(), b_runs.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&b_runs);
                    y_b.get();
                });
            }
        })
        .unwrap();
    assert_eq!((a_runs.get(), b_runs.get()), (1, 1));

    trigger.set(1);
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!((a_runs.get(), b_runs.get()), (2, 2));
    assert_eq!(y.get(), 1);
    assert!(!composition.has_invalidations());
    assert!(!recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!((a_runs.get(), b_runs.get()), (2, 2));
}

#[test]
fn remembered_objects_are_forgotten_exactly_once() {
    let (recomposer, composition) = setup();
    let show = recomposer.mutable_state_of(true);
    let log: Log = Rc::default();
    composition
        .set_content({
            let (show, log) = (show.clone(), log.clone());
            move |composer| {
                let (show, log) = (show.clone(), log.clone());
                composer.composable(call_site_key!(), (), move |composer, _| {
                    if show.get() {
                        composer.group(call_site_key!(), |composer| {
                            composer.remember_observer(|| Logged::new("a", &log));
                        });
                    }
                });
            }
        })
        .unwrap();
    assert_eq!(*log.borrow(), vec!["remembered a"]);

    show.set(false);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!(*log.borrow(), vec!["remembered a", "forgotten a"]);

    show.set(true);
    recomposer.run_recompose_and_apply_changes().unwrap();
    composition.dispose();
    composition.dispose();
    assert_eq!(
        *log.borrow(),
        vec!["remembered a", "forgotten a", "remembered a", "forgotten a"]
    );
    assert!(composition.is_disposed());
    assert_eq!(recomposer.composition_count(), 0);
}

#[test]
fn failed_pass_abandons_new_objects() {
    let (_recomposer, composition) = setup();
    let log: Log = Rc::default();
    let result = catch_unwind(AssertUnwindSafe(|| {
        let log = log.clone();
        composition.set_content(move |composer| {
            composer.remember_observer(|| Logged::new("a", &log));
            panic!("content failed");
        })
    }));
    assert!(result.is_err());
    assert_eq!(*log.borrow(), vec!["abandoned a"]);
    assert!(!composition.is_composing());
    assert!(!composition.has_pending_changes());
    composition.dispose();
    assert_eq!(*log.borrow(), vec!["abandoned a"]);
}

#[test]
fn dispose_releases_nodes_and_is_idempotent() {
    let (_recomposer, composition) = setup();
    let log: Log = Rc::default();
    composition
        .set_content({
            let log = log.clone();
            move |composer| {
                let log = log.clone();
                composer.node(call_site_key!(), move || Leaf::logged(1, &log), |_| {});
            }
        })
        .unwrap();
    assert_eq!(root_children(&composition).len(), 1);

    composition.dispose();
    assert_eq!(*log.borrow(), vec!["release 1"]);
    assert!(composition.with_applier(|applier| applier.is_empty()));
    composition.dispose();
    assert_eq!(*log.borrow(), vec!["release 1"]);
    assert_eq!(composition.apply_changes(), Err(ComposeError::Disposed));
}

#[test]
fn unchanged_parameters_skip_the_child() {
    let (recomposer, composition) = setup();
    let value = recomposer.mutable_state_of(0);
    let (parent_runs, child_runs) = (counter(), counter());
    composition
        .set_content({
            let (value, parent_runs, child_runs) = (value.clone(), parent_runs.clone(), child_runs.clone());
            move |composer| {
                let (value, parent_runs, child_runs) = (value.clone(), parent_runs.clone(), child_runs.clone());
                composer.composable(call_site_key!(), (), move |composer, _| {
                    bump(&parent_runs);
                    let bucket = value.get() / 10;
                    let child_runs = child_runs.clone();
                    composer.composable(call_site_key!(), bucket, move |_, _| bump(&child_runs));
                });
            }
        })
        .unwrap();
    let before = composition.with_slot_table(|table| format!("{table:?}"));

    value.set(1);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!((parent_runs.get(), child_runs.get()), (2, 1));
    assert_eq!(composition.with_slot_table(|table| format!("{table:?}")), before);

    value.set(10);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!((parent_runs.get(), child_runs.get()), (3, 2));
    composition.verify_consistent();
}

#[test]
fn failed_apply_damages_the_composition() {
    let recomposer = Recomposer::default();
    let fail = Rc::new(Cell::new(true));
    let composition = recomposer.composition(FailingApplier {
        inner: MemoryApplier::new(),
        fail: fail.clone(),
    });
    let log: Log = Rc::default();
    let result = composition.set_content({
        let log = log.clone();
        move |composer| {
            composer.remember_observer(|| Logged::new("a", &log));
            composer.node(call_site_key!(), || Leaf::new(1), |_| {});
        }
    });
    assert!(matches!(result, Err(ComposeError::Apply(_))));
    assert_eq!(composition.state(), CompositionState::Damaged);
    assert_eq!(*log.borrow(), vec!["abandoned a"]);
    assert_eq!(composition.apply_changes(), Err(ComposeError::Damaged));

    fail.set(false);
    composition.dispose();
    assert!(composition.is_disposed());
    assert_eq!(*log.borrow(), vec!["abandoned a"]);
}

#[test]
fn unchanged_derived_value_retracts_the_invalidation() {
    let (recomposer, composition) = setup();
    let x = recomposer.mutable_state_of(0);
    let even = recomposer.derived_state_of({
        let x = x.clone();
        move || x.get() % 2 == 0
    });
    let runs = counter();
    let seen = Rc::new(Cell::new(false));
    composition
        .set_content({
            let (even, runs, seen) = (even.clone(), runs.clone(), seen.clone());
            move |composer| {
                let (even, runs, seen) = (even.clone(), runs.clone(), seen.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&runs);
                    seen.set(even.get());
                });
            }
        })
        .unwrap();
    assert!(seen.get());

    x.set(2);
    assert!(composition.has_invalidations());
    assert!(!recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 1);

    x.set(3);
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 2);
    assert!(!seen.get());
}

#[test]
fn keyed_children_keep_state_and_nodes_when_reordered() {
    let (recomposer, composition) = setup();
    let items = recomposer.mutable_state_of(vec![1, 2, 3]);
    let created = counter();
    composition
        .set_content({
            let (items, created) = (items.clone(), created.clone());
            move |composer| {
                let (items, created) = (items.clone(), created.clone());
                composer.composable(call_site_key!(), (), move |composer, _| {
                    for item in items.get() {
                        let created = created.clone();
                        composer.with_key(&item, |composer| {
                            composer.remember(|| bump(&created));
                            composer.node(call_site_key!(), move || Leaf::new(item), |_| {});
                        });
                    }
                });
            }
        })
        .unwrap();
    let ids = root_children(&composition);
    assert_eq!(leaf_names(&composition), vec![1, 2, 3]);

    items.set(vec![3, 1, 2]);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!(leaf_names(&composition), vec![3, 1, 2]);
    assert_eq!(root_children(&composition), vec![ids[2], ids[0], ids[1]]);
    assert_eq!(created.get(), 3);

    items.set(vec![2]);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!(root_children(&composition), vec![ids[1]]);
    composition.verify_consistent();
}

#[test]
fn deactivated_content_is_reused() {
    let (_recomposer, composition) = setup();
    let log: Log = Rc::default();
    let content = |log: Log| {
        move |composer: &mut Composer<'_>| {
            let log = log.clone();
            let inner = log.clone();
            composer.node(
                call_site_key!(),
                move || Leaf::logged(7, &log),
                move |composer| {
                    composer.remember_observer(|| Logged::new("r", &inner));
                },
            );
        }
    };
    composition.set_content(content(log.clone())).unwrap();
    let ids = root_children(&composition);
    log.borrow_mut().clear();

    composition.deactivate();
    assert_eq!(*log.borrow(), vec!["forgotten r", "deactivate 7"]);
    log.borrow_mut().clear();

    composition.set_content_with_reuse(content(log.clone())).unwrap();
    assert_eq!(*log.borrow(), vec!["reuse 7", "remembered r"]);
    assert_eq!(root_children(&composition), ids);
}

#[test]
fn groups_with_key_invalidate_their_enclosing_scope() {
    const MARKER: Key = 0x5eed;
    let (recomposer, composition) = setup();
    let (outer_runs, inner_runs) = (counter(), counter());
    composition
        .set_content({
            let (outer_runs, inner_runs) = (outer_runs.clone(), inner_runs.clone());
            move |composer| {
                let (outer_runs, inner_runs) = (outer_runs.clone(), inner_runs.clone());
                composer.composable(call_site_key!(), (), move |composer, _| {
                    bump(&outer_runs);
                    let inner_runs = inner_runs.clone();
                    composer.composable(call_site_key!(), (), move |composer, _| {
                        bump(&inner_runs);
                        composer.group(MARKER, |_| {});
                    });
                });
            }
        })
        .unwrap();

    composition.invalidate_groups_with_key(MARKER);
    assert!(composition.has_invalidations());
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!((outer_runs.get(), inner_runs.get()), (1, 2));

    composition.invalidate_all();
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!(outer_runs.get(), 2);
    assert!(inner_runs.get() >= 3);
}

#[test]
fn observers_hear_every_pass_until_disposed() {
    struct Counting {
        begins: Cell<usize>,
        ends: Cell<usize>,
        invalidations: Cell<usize>,
    }

    impl CompositionObserver for Counting {
        fn on_begin_composition(&self, _: CompositionId, invalidations: &[RecomposeScope]) {
            bump(&self.begins);
            self.invalidations
                .set(self.invalidations.get() + invalidations.len());
        }

        fn on_end_composition(&self, _: CompositionId) {
            bump(&self.ends);
        }
    }

    let (recomposer, composition) = setup();
    let observer = Rc::new(Counting {
        begins: Cell::new(0),
        ends: Cell::new(0),
        invalidations: Cell::new(0),
    });
    let mut handle = composition.observe(observer.clone());
    let x = recomposer.mutable_state_of(0);
    composition
        .set_content({
            let x = x.clone();
            move |composer| {
                let x = x.clone();
                composer.composable(call_site_key!(), (), move |_, _| {
                    x.get();
                });
            }
        })
        .unwrap();
    x.set(1);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!((observer.begins.get(), observer.ends.get()), (2, 2));
    assert_eq!(observer.invalidations.get(), 1);

    handle.dispose();
    x.set(2);
    recomposer.run_recompose_and_apply_changes().unwrap();
    assert_eq!(observer.begins.get(), 2);
}

#[test]
fn effects_run_after_apply_and_clean_up_on_key_change() {
    let (recomposer, composition) = setup();
    let key = recomposer.mutable_state_of(1);
    let log: Log = Rc::default();
    composition
        .set_content({
            let (key, log) = (key.clone(), log.clone());
            move |composer| {
                let (key, log) = (key.clone(), log.clone());
                composer.composable(call_site_key!(), (), move |composer, _| {
                    let current = key.get();
                    let log = log.clone();
                    let applied = log.clone();
                    composer.disposable_effect(current, move |scope| {
                        log.borrow_mut().push(format!("start {current}"));
                        scope.on_dispose(move || log.borrow_mut().push(format!("stop {current}")))
                    });
                    composer.side_effect(move || applied.borrow_mut().push(format!("applied {current}")));
                });
            }
        })
        .unwrap();
    assert_eq!(*log.borrow(), vec!["start 1", "applied 1"]);

    key.set(2);
    recomposer.run_recompose_and_apply_changes().unwrap();
    composition.dispose();
    assert_eq!(
        *log.borrow(),
        vec!["start 1", "applied 1", "stop 1", "start 2", "applied 2", "stop 2"]
    );
}

#[test]
fn modifications_recorded_from_another_thread_are_picked_up() {
    let (recomposer, composition) = setup();
    let x = recomposer.mutable_state_of(0);
    let runs = counter();
    composition
        .set_content({
            let (x, runs) = (x.clone(), runs.clone());
            move |composer| {
                let (x, runs) = (x.clone(), runs.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&runs);
                    x.get();
                });
            }
        })
        .unwrap();
    let recorder = composition.modification_recorder();
    let id = x.id();
    std::thread::spawn(move || {
        let mut values = crate::collections::map::HashSet::default();
        values.insert(id);
        recorder.record_modifications_of(values);
    })
    .join()
    .unwrap();
    assert!(composition.has_invalidations());
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 2);
}

#[test]
#[should_panic(expected = "already busy")]
fn re_entrant_composition_panics() {
    let (_recomposer, composition) = setup();
    let composition = Rc::new(composition);
    let target: Rc<RefCell<Option<Rc<Composition<MemoryApplier>>>>> = Rc::default();
    *target.borrow_mut() = Some(composition.clone());
    let _ = composition.set_content(move |_| {
        if let Some(composition) = target.borrow().as_ref() {
            composition.recompose();
        }
    });
}

#[test]
fn retracted_derived_invalidation_keeps_observing() {
    let (recomposer, composition) = setup();
    let x = recomposer.mutable_state_of(0);
    let even = recomposer.derived_state_of({
        let x = x.clone();
        move || x.get() % 2 == 0
    });
    let runs = counter();
    composition
        .set_content({
            let (even, runs) = (even.clone(), runs.clone());
            move |composer| {
                let (even, runs) = (even.clone(), runs.clone());
                composer.composable(call_site_key!(), (), move |_, _| {
                    bump(&runs);
                    even.get();
                });
            }
        })
        .unwrap();

    let recorder = composition.modification_recorder();
    let id = x.id();
    std::thread::spawn(move || {
        let mut values = crate::collections::map::HashSet::default();
        values.insert(id);
        recorder.record_modifications_of(values);
    })
    .join()
    .unwrap();
    assert!(!recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 1);
    let mut observed: crate::collections::map::HashSet<StateId> = Default::default();
    observed.insert(x.id());
    assert!(composition.observes_any_of(&observed));

    x.set(1);
    assert!(composition.has_invalidations());
    assert!(recomposer.run_recompose_and_apply_changes().unwrap());
    assert_eq!(runs.get(), 2);
}
