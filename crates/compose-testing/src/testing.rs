use std::cell::RefCell;
use std::rc::Rc;

use compose_core::{
    Applier, Composer, ComposeError, Composition, MemoryApplier, MutableState, Node, NodeError, NodeId, Recomposer,
    RememberObserver,
};

/// Frames `pump_until_idle` runs before it gives up on a composition that
/// keeps invalidating itself.
const MAX_FRAMES: usize = 64;

/// Headless harness for exercising compositions in tests.
///
/// `ComposeTestRule` owns a [`Recomposer`] and one composition backed by the
/// in-memory applier, and exposes helpers for driving frames and inspecting
/// the produced node tree without a host event loop.
pub struct ComposeTestRule {
    recomposer: Recomposer,
    composition: Composition<MemoryApplier>,
    has_content: bool,
}

impl ComposeTestRule {
    /// Create a new test rule backed by the default in-memory applier.
    pub fn new() -> Self {
        let recomposer = Recomposer::default();
        let composition = recomposer.composition(MemoryApplier::new());
        Self {
            recomposer,
            composition,
            has_content: false,
        }
    }

    /// Install the provided content into the composition and perform an
    /// initial render.
    pub fn set_content(&mut self, content: impl Fn(&mut Composer<'_>) + 'static) -> Result<(), ComposeError> {
        self.has_content = true;
        self.composition.set_content(content)
    }

    /// Run one frame. Returns whether any composition recomposed.
    pub fn frame(&mut self) -> Result<bool, ComposeError> {
        self.recomposer.run_recompose_and_apply_changes()
    }

    /// Drive frames until nothing is invalid and no changes are pending.
    /// Returns the number of frames that ran.
    pub fn pump_until_idle(&mut self) -> Result<usize, ComposeError> {
        let mut frames = 0;
        while self.recomposer.needs_frame() || self.recomposer.has_pending_work() {
            if frames == MAX_FRAMES {
                panic!("composition did not settle after {MAX_FRAMES} frames");
            }
            self.recomposer.run_recompose_and_apply_changes()?;
            frames += 1;
        }
        log::trace!("test rule idle after {frames} frame(s)");
        Ok(frames)
    }

    /// Create a state object tracked by this rule's recomposer.
    pub fn mutable_state_of<T: Clone + PartialEq + 'static>(&self, value: T) -> MutableState<T> {
        self.recomposer.mutable_state_of(value)
    }

    pub fn recomposer(&self) -> &Recomposer {
        &self.recomposer
    }

    /// Returns whether user content has been installed in this rule.
    pub fn has_content(&self) -> bool {
        self.has_content
    }

    /// Access the raw composition for advanced scenarios.
    pub fn composition(&self) -> &Composition<MemoryApplier> {
        &self.composition
    }

    pub fn with_applier<R>(&self, f: impl FnOnce(&mut MemoryApplier) -> R) -> R {
        self.composition.with_applier(f)
    }

    /// Children of the root node, in order.
    pub fn root_children(&self) -> Vec<NodeId> {
        self.with_applier(|applier| {
            let root = applier.root();
            applier.children(root)
        })
    }

    /// Reads a node of type `N`.
    pub fn read_node<N: Node + 'static, R>(&self, id: NodeId, f: impl FnOnce(&N) -> R) -> Result<R, NodeError> {
        self.with_applier(|applier| applier.with_node(id, |node: &mut N| f(node)))
    }

    /// Tree dump of the applier, one node per line.
    pub fn dump_tree(&self) -> String {
        self.with_applier(|applier| applier.dump_tree())
    }

    pub fn dispose(&mut self) {
        self.composition.dispose();
        self.has_content = false;
    }
}

impl Default for ComposeTestRule {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ComposeTestRule {
    fn drop(&mut self) {
        self.composition.dispose();
    }
}

/// Convenience helper for tests that only need temporary access to a
/// `ComposeTestRule`.
pub fn run_test_composition<R>(f: impl FnOnce(&mut ComposeTestRule) -> R) -> R {
    let mut rule = ComposeTestRule::new();
    f(&mut rule)
}

/// Shared, ordered record of lifecycle callbacks.
#[derive(Clone, Default)]
pub struct LifecycleLog {
    entries: Rc<RefCell<Vec<String>>>, // FUTURE(no_std): replace Vec with ring buffer for testing.
}

impl LifecycleLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.entries.borrow_mut().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    /// Returns the entries and empties the log.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// A remember observer writing `remembered|forgotten|abandoned <name>`.
    pub fn observer(&self, name: &str) -> RecordingObserver {
        RecordingObserver {
            name: name.to_owned(),
            log: self.clone(),
        }
    }
}

impl std::fmt::Debug for LifecycleLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.borrow().iter()).finish()
    }
}

pub struct RecordingObserver {
    name: String,
    log: LifecycleLog,
}

impl RecordingObserver {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RememberObserver for RecordingObserver {
    fn on_remembered(&self) {
        self.log.push(format!("remembered {}", self.name));
    }

    fn on_forgotten(&self) {
        self.log.push(format!("forgotten {}", self.name));
    }

    fn on_abandoned(&self) {
        self.log.push(format!("abandoned {}", self.name));
    }
}

/// Node with a tag and a mutable value. Lifecycle callbacks go to the log
/// when one is attached.
#[derive(Default)]
pub struct TestNode {
    pub tag: String,
    pub value: i32,
    log: Option<LifecycleLog>,
}

impl TestNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn logged(tag: impl Into<String>, log: &LifecycleLog) -> Self {
        Self {
            tag: tag.into(),
            value: 0,
            log: Some(log.clone()),
        }
    }

    fn record(&self, event: &str) {
        if let Some(log) = &self.log {
            log.push(format!("{event} {}", self.tag));
        }
    }
}

impl Node for TestNode {
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
