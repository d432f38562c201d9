//! Platform abstraction traits for the recomposer.
//!
//! The host decides when frames run; the recomposer only asks for one when
//! compositions have work pending.

/// Schedules work for the recomposer.
///
/// Implementations must be safe to use from multiple threads, since state
/// modifications can be recorded from any thread.
pub trait RuntimeScheduler: Send + Sync {
    /// Request that the host call
    /// [`Recomposer::run_recompose_and_apply_changes`](crate::Recomposer::run_recompose_and_apply_changes)
    /// soon.
    fn schedule_frame(&self);
}

/// Scheduler for hosts that drive frames themselves.
#[derive(Debug, Default)]
pub struct DefaultScheduler;

impl RuntimeScheduler for DefaultScheduler {
    fn schedule_frame(&self) {}
}
