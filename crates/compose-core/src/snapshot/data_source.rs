use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::{StateId, StateRef};
use crate::collections::map::HashSet;

/// Called for every read while an observation is active. Returns whether the
/// read was newly recorded.
pub type RecordDependency = Rc<dyn Fn(&StateRef) -> bool>;

/// Called for every write made inside an isolation.
pub type RecordChange = Rc<dyn Fn(&StateRef)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationOutcome {
    /// Buffered writes are published.
    Completed,
    /// Buffered writes are discarded.
    Failed,
}

/// A provider of observable state.
///
/// Every observation or isolation bracket is entered on all registered sources
/// in registration order and exited in reverse order. The tokens returned by
/// the `start`/`pause` calls are handed back on exit.
pub trait DataSource: 'static {
    type Observation: 'static;
    type Isolation: 'static;

    fn start_observation(&self, record_dependency: RecordDependency) -> Self::Observation;
    fn end_observation(&self, previous: Self::Observation);
    fn pause_current_observation(&self) -> Self::Observation;
    fn resume_current_observation(&self, paused: Self::Observation);
    fn start_isolation(&self, record_change: Option<RecordChange>) -> Self::Isolation;
    fn end_isolation(&self, outcome: IsolationOutcome, previous: Self::Isolation);
}

type Token = Box<dyn Any>;

trait ErasedDataSource {
    fn identity(&self) -> usize;
    fn start_observation(&self, record_dependency: RecordDependency) -> Token;
    fn end_observation(&self, previous: Token);
    fn pause_current_observation(&self) -> Token;
    fn resume_current_observation(&self, paused: Token);
    fn start_isolation(&self, record_change: Option<RecordChange>) -> Token;
    fn end_isolation(&self, outcome: IsolationOutcome, previous: Token);
}

struct Erased<D>(Rc<D>);

fn unbox<T: 'static>(token: Token) -> T {
    match token.downcast::<T>() {
        Ok(token) => *token,
        Err(_) => panic!("data source received a token it did not issue"),
    }
}

impl<D: DataSource> ErasedDataSource for Erased<D> {
    fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    fn start_observation(&self, record_dependency: RecordDependency) -> Token {
        Box::new(self.0.start_observation(record_dependency))
    }

    fn end_observation(&self, previous: Token) {
        self.0.end_observation(unbox::<D::Observation>(previous));
    }

    fn pause_current_observation(&self) -> Token {
        Box::new(self.0.pause_current_observation())
    }

    fn resume_current_observation(&self, paused: Token) {
        self.0.resume_current_observation(unbox::<D::Observation>(paused));
    }

    fn start_isolation(&self, record_change: Option<RecordChange>) -> Token {
        Box::new(self.0.start_isolation(record_change))
    }

    fn end_isolation(&self, outcome: IsolationOutcome, previous: Token) {
        self.0.end_isolation(outcome, unbox::<D::Isolation>(previous));
    }
}

type Sources = Rc<Vec<Rc<dyn ErasedDataSource>>>;
type Invalidator = Rc<dyn Fn(&HashSet<StateId>)>;

#[derive(Default)]
struct RegistryInner {
    // Replaced wholesale on every change; brackets keep the list they entered with.
    sources: RefCell<Sources>,
    invalidators: RefCell<Vec<(u64, Invalidator)>>,
    next_invalidator: Cell<u64>,
}

/// Registry of data sources shared by the compositions of one recomposer.
#[derive(Clone, Default)]
pub struct DataSourceRegistry {
    inner: Rc<RegistryInner>,
}

#[derive(Clone, Default)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<DataSourceRegistry> {
        self.0.upgrade().map(|inner| DataSourceRegistry { inner })
    }
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Rc::downgrade(&self.inner))
    }

    fn sources(&self) -> Sources {
        self.inner.sources.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.sources.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `source`. Panics if it is already registered.
    pub fn register<D: DataSource>(&self, source: Rc<D>) -> ObserverHandle {
        let erased: Rc<dyn ErasedDataSource> = Rc::new(Erased(source));
        let identity = erased.identity();
        {
            let mut sources = self.inner.sources.borrow_mut();
            if sources.iter().any(|held| held.identity() == identity) {
                panic!("data source is already registered");
            }
            let mut next: Vec<_> = sources.iter().cloned().collect();
            next.push(erased);
            *sources = Rc::new(next);
        }
        let registry = Rc::downgrade(&self.inner);
        ObserverHandle::new(move || {
            if let Some(inner) = registry.upgrade() {
                let mut sources = inner.sources.borrow_mut();
                let next: Vec<_> = sources
                    .iter()
                    .filter(|held| held.identity() != identity)
                    .cloned()
                    .collect();
                *sources = Rc::new(next);
            }
        })
    }

    /// Runs `block` with every read reported to `record_dependency`.
    pub fn observe<R>(&self, record_dependency: RecordDependency, block: impl FnOnce() -> R) -> R {
        let sources = self.sources();
        let mut tokens = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            tokens.push(source.start_observation(record_dependency.clone()));
        }
        let _guard = ObservationGuard {
            sources,
            tokens,
            resume: false,
        };
        block()
    }

    /// Runs `block` with the current observation of every source paused.
    pub fn without_read_observation<R>(&self, block: impl FnOnce() -> R) -> R {
        let sources = self.sources();
        let mut tokens = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            tokens.push(source.pause_current_observation());
        }
        let _guard = ObservationGuard {
            sources,
            tokens,
            resume: true,
        };
        block()
    }

    /// Runs `block` with writes buffered. The writes are published if it
    /// returns and discarded if it unwinds.
    pub fn isolate<R>(&self, record_change: Option<RecordChange>, block: impl FnOnce() -> R) -> R {
        let sources = self.sources();
        let mut tokens = Vec::with_capacity(sources.len());
        for source in sources.iter() {
            tokens.push(source.start_isolation(record_change.clone()));
        }
        let mut guard = IsolationGuard {
            sources,
            tokens,
            outcome: IsolationOutcome::Failed,
        };
        let result = block();
        guard.outcome = IsolationOutcome::Completed;
        drop(guard);
        result
    }

    /// Notifies every invalidator that `ids` changed.
    pub fn invalidate_dependants(&self, ids: &HashSet<StateId>) {
        if ids.is_empty() {
            return;
        }
        let invalidators: Vec<Invalidator> = self
            .inner
            .invalidators
            .borrow()
            .iter()
            .map(|(_, invalidator)| invalidator.clone())
            .collect();
        for invalidator in invalidators {
            invalidator(ids);
        }
    }

    pub fn register_invalidator(&self, invalidator: impl Fn(&HashSet<StateId>) + 'static) -> ObserverHandle {
        let id = self.inner.next_invalidator.get();
        self.inner.next_invalidator.set(id + 1);
        self.inner
            .invalidators
            .borrow_mut()
            .push((id, Rc::new(invalidator)));
        let registry = Rc::downgrade(&self.inner);
        ObserverHandle::new(move || {
            if let Some(inner) = registry.upgrade() {
                inner
                    .invalidators
                    .borrow_mut()
                    .retain(|(held, _)| *held != id);
            }
        })
    }
}

impl fmt::Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceRegistry")
            .field("sources", &self.len())
            .field("invalidators", &self.inner.invalidators.borrow().len())
            .finish()
    }
}

struct ObservationGuard {
    sources: Sources,
    tokens: Vec<Token>,
    resume: bool,
}

impl Drop for ObservationGuard {
    fn drop(&mut self) {
        while let Some(token) = self.tokens.pop() {
            let source = &self.sources[self.tokens.len()];
            if self.resume {
                source.resume_current_observation(token);
            } else {
                source.end_observation(token);
            }
        }
    }
}

struct IsolationGuard {
    sources: Sources,
    tokens: Vec<Token>,
    outcome: IsolationOutcome,
}

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        while let Some(token) = self.tokens.pop() {
            self.sources[self.tokens.len()].end_isolation(self.outcome, token);
        }
    }
}

/// Disposable registration.
#[must_use = "dropping the handle keeps the registration alive; call dispose() to remove it"]
pub struct ObserverHandle {
    dispose: Option<Box<dyn FnOnce()>>,
}

impl ObserverHandle {
    pub fn new(dispose: impl FnOnce() + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn dispose(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.dispose.is_none()
    }
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
