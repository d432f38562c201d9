#![doc = r"Composition and recomposition engine for Compose-RS."]

extern crate self as compose_core;

pub mod applier;
pub mod change_list;
pub mod collections;
pub mod composer;
pub mod composition;
pub mod effects;
pub mod error;
pub mod hash;
pub mod movable_content;
pub mod owned;
pub mod pending;
pub mod platform;
pub mod recompose_scope;
pub mod recomposer;
pub mod remember;
pub mod scope_map;
pub mod slot_table;
pub mod snapshot;

pub use applier::{allocate_node_id, Applier, MemoryApplier, Node, NodeError, NodeId};
pub use change_list::ChangeList;
pub use composer::{Composer, Content};
pub use composition::{
    Composition, CompositionContext, CompositionId, CompositionObserver, CompositionState, ControlledComposition,
};
pub use effects::{DisposableEffectResult, DisposableEffectScope};
pub use error::ComposeError;
pub use hash::{data_key, location_key};
pub use movable_content::{movable_content_of, MovableContent, MovableContentState, MovableContentStateReference};
pub use owned::Owned;
pub use pending::{ModificationRecorder, PendingModifications};
pub use platform::{DefaultScheduler, RuntimeScheduler};
pub use recompose_scope::{InvalidationResult, RecomposeScope, ScopeId};
pub use recomposer::Recomposer;
pub use remember::{RememberEventDispatcher, RememberManager, RememberObserver};
pub use scope_map::ScopeMap;
pub use slot_table::{Anchor, GroupKind, Key, Slot, SlotReader, SlotTable, SlotWriter};
pub use snapshot::{
    DataSource, DataSourceRegistry, DerivedState, MutableState, MutationPolicy, NeverEqual, ObserverHandle,
    SnapshotSystem, StateId, StateObject, StateRef, StructuralEquality,
};

#[cfg(test)]
#[path = "tests/composition_tests.rs"]
mod composition_tests;

#[cfg(test)]
#[path = "tests/movable_content_tests.rs"]
mod movable_content_tests;
