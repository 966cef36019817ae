//! Errors the scheduler surfaces to its caller.
//!
//! The scheduler never aborts, logs on the caller's behalf, or retries: it
//! returns one of these and lets the HTTP/3 connection decide whether to
//! close itself, reset a stream, or drop the frame.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerError {
    /// A `PRIORITY` frame violated a validation rule (self-dependency,
    /// `current` used where illegal, etc). Fatal to the stream/connection
    /// per HTTP/3 semantics.
    #[error("PRIORITY frame is malformed")]
    MalformedPriority,

    /// Node or heap allocation failed. The operation that returned this is
    /// a no-op on scheduler state.
    #[error("out of memory allocating a priority tree node")]
    OutOfMemory,

    /// A `PRIORITY` frame, write, or stream-end referenced a placeholder id
    /// beyond the negotiated limit, or a stream id the peer is not
    /// permitted to open. Fatal.
    #[error("PRIORITY frame references an id the peer is not permitted to use")]
    InvalidTarget,
}
