//! Error taxonomy surfaced by frame operations.

use thiserror::Error;

/// Errors produced by the coordination layer and its collaborators.
#[derive(Clone, Debug, Error)]
pub enum FrameError {
    /// Progress deadline reached. The message carries the timeout and any
    /// progress log collected before the deadline fired.
    #[error("{0}")]
    Timeout(String),

    /// A request carrying the pending document id failed.
    #[error("{0}")]
    Navigation(String),

    /// A different document committed while waiting for a specific one.
    #[error("navigation interrupted by another one")]
    NavigationInterrupted,

    /// The frame detached while an operation held it.
    #[error("{0}")]
    FrameDetached(String),

    /// The browser transport disconnected.
    #[error("page closed or disconnected")]
    PageDisconnected,

    /// An execution context went away mid-evaluation. Reported by the
    /// context layer through its message text; rerunnable tasks absorb it.
    #[error("{0}")]
    ContextDestroyed(String),

    /// The target node was removed from the DOM between find and act.
    /// Absorbed by the element-action retry loop.
    #[error("{0}")]
    NotConnected(String),

    /// Malformed caller input. `hint` carries the suggested correction for
    /// the rejected legacy spellings.
    #[error("{message}")]
    InvalidArgument {
        message: String,
        hint: Option<String>,
    },

    /// An inline script or style was blocked by Content Security Policy.
    #[error("{0}")]
    Csp(String),

    /// Evaluation failure reported by an external collaborator.
    #[error("{0}")]
    Evaluation(String),

    /// Invariant breakage inside the coordination layer itself.
    #[error("{0}")]
    Internal(String),
}

impl FrameError {
    pub fn frame_detached() -> Self {
        FrameError::FrameDetached("frame was detached".to_string())
    }

    pub fn not_connected() -> Self {
        FrameError::NotConnected("Element is not attached to the DOM".to_string())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        FrameError::InvalidArgument {
            message: message.into(),
            hint: None,
        }
    }

    pub fn invalid_argument_with_hint(
        message: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        FrameError::InvalidArgument {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    /// Correction suggested for a rejected argument, when one exists.
    pub fn hint(&self) -> Option<&str> {
        match self {
            FrameError::InvalidArgument { hint, .. } => hint.as_deref(),
            _ => None,
        }
    }

    /// True when the error text matches one of the strings the context layer
    /// uses to report that its execution context went away. These never
    /// surface to callers; the owning rerunnable task retries instead.
    pub fn is_context_destroyed(&self) -> bool {
        let text = self.to_string();
        text.contains("Execution context was destroyed")
            || text.contains("Cannot find context with specified id")
    }
}
