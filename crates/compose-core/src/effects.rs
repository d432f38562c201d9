use std::cell::RefCell;

use crate::remember::RememberObserver;

/// Receiver of a disposable effect; registers the cleanup to run when the
/// effect leaves the composition.
pub struct DisposableEffectScope {
    _private: (),
}

impl DisposableEffectScope {
    pub fn on_dispose(&self, cleanup: impl FnOnce() + 'static) -> DisposableEffectResult {
        DisposableEffectResult::new(cleanup)
    }
}

#[derive(Default)]
pub struct DisposableEffectResult {
    cleanup: Option<Box<dyn FnOnce()>>,
}

impl DisposableEffectResult {
    pub fn new(cleanup: impl FnOnce() + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

type Effect = Box<dyn FnOnce(DisposableEffectScope) -> DisposableEffectResult>;

/// Runs its effect when remembered and the cleanup when forgotten. An
/// abandoned effect never ran, so there is nothing to clean up.
pub(crate) struct DisposableEffectState {
    effect: RefCell<Option<Effect>>,
    cleanup: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl DisposableEffectState {
    pub(crate) fn new(effect: impl FnOnce(DisposableEffectScope) -> DisposableEffectResult + 'static) -> Self {
        Self {
            effect: RefCell::new(Some(Box::new(effect))),
            cleanup: RefCell::new(None),
        }
    }
}

impl RememberObserver for DisposableEffectState {
    fn on_remembered(&self) {
        let effect = self.effect.borrow_mut().take();
        if let Some(effect) = effect {
            let result = effect(DisposableEffectScope { _private: () });
            *self.cleanup.borrow_mut() = result.cleanup;
        }
    }

    fn on_forgotten(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }

    fn on_abandoned(&self) {
        self.effect.borrow_mut().take();
    }
}
