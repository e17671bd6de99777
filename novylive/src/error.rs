//! Error taxonomy shared across the runtime.
//!
//! Not-found and malformed-input conditions are ordinary typed errors that
//! map onto 4xx responses; a panic inside user-supplied code is recovered at
//! the call boundary and surfaced as [`RuntimeError::HandlerPanicked`].

use std::any::Any;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown notifier: {0}")]
    UnknownNotifier(String),

    #[error("unknown callback: {0}")]
    UnknownCallback(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("callback {callback_id} for widget {widget_id} ({event_kind}) panicked: {message}")]
    HandlerPanicked {
        callback_id: String,
        widget_id: String,
        event_kind: String,
        message: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// True for the not-found family (unknown notifier or callback ID).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RuntimeError::UnknownNotifier(_) | RuntimeError::UnknownCallback(_)
        )
    }
}

/// Best-effort extraction of a panic payload for logging.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
