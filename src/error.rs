//! Typed errors for session and backend operations.

use crate::event::EventKind;
use crate::session::SessionState;

/// Everything that can go wrong while configuring, opening or reading a
/// [`Session`](crate::session::Session).
#[derive(thiserror::Error, Debug)]
pub enum PerfError {
    #[error("operation requires state {expected:?}, session is in {actual:?}")]
    WrongState {
        expected: SessionState,
        actual: SessionState,
    },

    #[error("event {0:?} is not resolvable on this host/backend")]
    UnsupportedEvent(EventKind),

    #[error("session has no events to open")]
    NoEvents,

    #[error("permission denied (privilege or entitlement required): {0}")]
    PermissionDenied(String),

    #[error("backend bring-up failed: {0}")]
    LoadFailed(String),

    #[error("backend is not loaded; call load() first")]
    NotLoaded,

    #[error("kernel counter read was short or malformed")]
    ShortRead,

    #[error("group-read counter id at position {position} did not match the id stored at open")]
    CounterOrderMismatch { position: usize },

    #[error("counter slot capacity ({max}) exceeded")]
    CapacityExceeded { max: usize },

    #[error(transparent)]
    Os(#[from] std::io::Error),
}
