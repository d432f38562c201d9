use thiserror::Error;

use crate::applier::NodeError;

/// Failure to bring the applier in line with a composition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComposeError {
    /// Replaying a change failed. The composition is damaged and must be
    /// disposed.
    #[error("applying changes failed: {0}")]
    Apply(#[from] NodeError),
    #[error("composition is damaged by an earlier failure and must be disposed")]
    Damaged,
    #[error("composition is disposed")]
    Disposed,
}
