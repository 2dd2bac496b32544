#![forbid(unsafe_code)]

//! Error types for signal mutation and serialized state requests.

use thiserror::Error;

use crate::registry::SignalId;

pub type Result<T, E = SignalError> = std::result::Result<T, E>;

/// Errors raised by the mutation API of [`Mutable`](crate::Mutable) and
/// [`AtomicMutable`](crate::AtomicMutable).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("signal {id} has been disposed")]
    Disposed { id: SignalId },
}

/// Errors raised by requests to a [`State`](crate::State).
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state manager has been disposed")]
    Disposed,

    #[error("state processing loop is no longer running")]
    Closed,

    #[error("update function panicked: {message}")]
    UpdatePanicked { message: String },

    #[error("synchronous request issued from the state processing thread")]
    Reentrant,

    #[error("failed to spawn state processing thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StateError {
    /// Build an [`UpdatePanicked`](Self::UpdatePanicked) from a caught panic payload.
    #[must_use]
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::UpdatePanicked {
            message: panic_message(payload),
        }
    }

    /// Whether the loop that produced this error will still serve requests.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::UpdatePanicked { .. } | Self::Reentrant)
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
