use thiserror::Error;

/// Error returned when an operation is submitted to, or awaited on, a
/// [`GrpcContext`](crate::context::GrpcContext) that has already stopped.
#[derive(Debug, Error)]
pub enum ContextError {
    /// [`GrpcContext::run`](crate::context::GrpcContext::run) was called from
    /// a second thread while another thread was already driving the run
    /// loop.
    #[error("GrpcContext is already running on another thread")]
    AlreadyRunning,

    /// An operation was submitted after the context had processed its
    /// shutdown sentinel.
    #[error("GrpcContext has been stopped")]
    Stopped,
}

/// Error type for the schedule sender's `error_types` channel.
///
/// The schedule operation never actually fails in normal operation (it only
/// ever completes or is cancelled via shutdown), so this type is kept
/// uninhabited in practice but named so the public API reads like a real
/// fallible channel rather than leaking `Infallible` directly.
#[derive(Debug, Error)]
#[error("schedule operation failed")]
pub struct ScheduleError(());

