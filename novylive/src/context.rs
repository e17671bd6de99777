//! Per-request context threaded explicitly through stateful operations.
//!
//! Every HTTP request and every queued update carries a [`RequestContext`],
//! so log lines and scheduled work can always be traced back to the request
//! that caused them. Contexts are passed as arguments, never stashed in a
//! task-local or global.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    id: String,
    started_at: SystemTime,
    session: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            started_at: SystemTime::now(),
            session: None,
        }
    }

    pub fn with_session(session: impl Into<String>) -> Self {
        Self {
            session: Some(session.into()),
            ..Self::new()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch, for wire timestamps.
pub(crate) fn now_millis() -> u64 {
    epoch_millis(SystemTime::now())
}

pub(crate) fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_ids_are_unique() {
        let a = RequestContext::new();
        let b = RequestContext::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
    }

    #[test]
    fn session_is_carried() {
        let ctx = RequestContext::with_session("sess-1");
        assert_eq!(ctx.session(), Some("sess-1"));
        assert!(RequestContext::new().session().is_none());
    }
}
