use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::applier::{Applier, NodeError, NodeId};
use crate::collections::map::HashSet;

/// Objects stored by `remember_observer` that want to hear about their
/// lifetime in the composition.
///
/// Exactly one of `on_forgotten` or `on_abandoned` is delivered for every
/// object the composer created: `on_abandoned` when the composition that
/// produced it was never applied, `on_forgotten` once it leaves the slot table
/// after having been remembered.
pub trait RememberObserver {
    fn on_remembered(&self);
    fn on_forgotten(&self);
    fn on_abandoned(&self);
}

/// A remembered value together with its lifecycle observer. Both point to the
/// same allocation.
#[derive(Clone)]
pub struct ObserverHolder {
    value: Rc<dyn Any>,
    observer: Rc<dyn RememberObserver>,
}

impl ObserverHolder {
    pub(crate) fn new<T: RememberObserver + 'static>(value: Rc<T>) -> Self {
        Self {
            value: value.clone(),
            observer: value,
        }
    }

    pub(crate) fn value(&self) -> &Rc<dyn Any> {
        &self.value
    }

    pub fn observer(&self) -> &Rc<dyn RememberObserver> {
        &self.observer
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.observer) as *const () as usize
    }
}

/// Objects created by a pass that have not been remembered yet.
#[derive(Default)]
pub struct AbandonSet {
    entries: Vec<ObserverHolder>,
}

impl AbandonSet {
    pub fn insert(&mut self, holder: ObserverHolder) {
        let identity = holder.identity();
        if !self.entries.iter().any(|entry| entry.identity() == identity) {
            self.entries.push(holder);
        }
    }

    pub fn remove(&mut self, holder: &ObserverHolder) -> bool {
        let identity = holder.identity();
        match self.entries.iter().position(|entry| entry.identity() == identity) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn pop(&mut self) -> Option<ObserverHolder> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn identities(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(ObserverHolder::identity)
    }
}

pub type SharedAbandonSet = Rc<RefCell<AbandonSet>>;

/// Collects lifecycle events while the change list is replayed.
pub trait RememberManager {
    fn remembering(&mut self, instance: ObserverHolder);
    fn forgetting(&mut self, instance: ObserverHolder);
    fn side_effect(&mut self, effect: Box<dyn FnOnce()>);
    fn deactivating(&mut self, node: NodeId);
    fn releasing(&mut self, node: NodeId);
}

enum Forgotten {
    Observer(ObserverHolder),
    Node(NodeId),
}

/// Dispatches the events a replay collected: forgotten objects last first,
/// then remembered objects in order, then side effects.
pub struct RememberEventDispatcher {
    abandoning: SharedAbandonSet,
    remembering: Vec<ObserverHolder>,
    forgetting: Vec<Forgotten>,
    releasing: HashSet<NodeId>,
    side_effects: Vec<Box<dyn FnOnce()>>,
}

impl RememberEventDispatcher {
    pub fn new(abandoning: SharedAbandonSet) -> Self {
        Self {
            abandoning,
            remembering: Vec::new(),
            forgetting: Vec::new(),
            releasing: HashSet::default(),
            side_effects: Vec::new(),
        }
    }

    pub fn dispatch_remember_observers(&mut self, applier: &mut dyn Applier) -> Result<(), NodeError> {
        while let Some(forgotten) = self.forgetting.pop() {
            match forgotten {
                Forgotten::Observer(holder) => {
                    self.abandoning.borrow_mut().remove(&holder);
                    holder.observer().on_forgotten();
                }
                Forgotten::Node(id) => {
                    if self.releasing.remove(&id) {
                        applier.get_mut(id)?.on_release();
                        applier.release(id)?;
                    } else {
                        applier.get_mut(id)?.on_deactivate();
                    }
                }
            }
        }
        for holder in std::mem::take(&mut self.remembering) {
            self.abandoning.borrow_mut().remove(&holder);
            holder.observer().on_remembered();
        }
        Ok(())
    }

    pub fn dispatch_side_effects(&mut self) {
        for effect in std::mem::take(&mut self.side_effects) {
            effect();
        }
    }

    pub fn dispatch_abandons(&mut self) {
        loop {
            // Removed before the callback so re-entrant dispatch cannot repeat it.
            let next = self.abandoning.borrow_mut().pop();
            match next {
                Some(holder) => holder.observer().on_abandoned(),
                None => break,
            }
        }
    }

    /// Drops pending forget notifications of objects that were already
    /// abandoned.
    pub(crate) fn skip_forgetting(&mut self, abandoned: &HashSet<usize>) {
        self.forgetting.retain(|forgotten| match forgotten {
            Forgotten::Observer(holder) => !abandoned.contains(&holder.identity()),
            Forgotten::Node(_) => true,
        });
    }

    pub fn has_pending(&self) -> bool {
        !self.remembering.is_empty() || !self.forgetting.is_empty() || !self.side_effects.is_empty()
    }
}

impl RememberManager for RememberEventDispatcher {
    fn remembering(&mut self, instance: ObserverHolder) {
        self.remembering.push(instance);
    }

    fn forgetting(&mut self, instance: ObserverHolder) {
        // Forgetting an object remembered in the same replay cancels both.
        let identity = instance.identity();
        if let Some(index) = self.remembering.iter().position(|held| held.identity() == identity) {
            self.remembering.remove(index);
            self.abandoning.borrow_mut().insert(instance);
            return;
        }
        self.forgetting.push(Forgotten::Observer(instance));
    }

    fn side_effect(&mut self, effect: Box<dyn FnOnce()>) {
        self.side_effects.push(effect);
    }

    fn deactivating(&mut self, node: NodeId) {
        self.forgetting.push(Forgotten::Node(node));
    }

    fn releasing(&mut self, node: NodeId) {
        self.releasing.insert(node);
        self.forgetting.push(Forgotten::Node(node));
    }
}
