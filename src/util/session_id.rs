//! Session identifiers for tracing relay sessions through logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for session IDs.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a session ID based on a process-wide counter.
///
/// Unique only within a single process.
/// Format: `conn-{counter}` where counter is zero-padded to 8 hex digits.
pub fn generate_session_id() -> String {
    let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn-{:08x}", count)
}

/// Session ID wrapper that can be included in tracing spans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate the next session ID.
    pub fn next() -> Self {
        Self(generate_session_id())
    }

    /// Get the session ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_session_id() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();

        assert_ne!(id1, id2);
        assert!(id1.starts_with("conn-"));
    }

    #[test]
    fn test_session_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            assert!(ids.insert(SessionId::next()), "duplicate ID generated");
        }
    }

    #[test]
    fn test_session_id_display() {
        let id = SessionId::next();
        assert_eq!(format!("{}", id), id.as_str());
    }
}
