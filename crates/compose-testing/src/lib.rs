//! Testing utilities and harness for Compose-RS

pub mod testing;

// Re-export testing utilities
pub use testing::*;

pub mod prelude {
    pub use crate::testing::*;
    pub use compose_core::{call_site_key, Composer, MutableState, NodeId, RememberObserver};
}
