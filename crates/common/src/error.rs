//! Error types for vmrelay

use thiserror::Error;

/// Result type alias using vmrelay Error
pub type Result<T> = std::result::Result<T, Error>;

/// vmrelay error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden: {0}")]
    Authorization(String),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Upstream error{}: {body}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Upstream { status: Option<u16>, body: String },

    #[error("Operation timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl ToString) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    /// HTTP status surfaced to callers before a WebSocket upgrade.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Authentication(_) => 401,
            Error::Authorization(_) => 403,
            Error::NotFound { .. } => 404,
            _ => 500,
        }
    }

    /// Terminal errors are returned immediately and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_)
                | Error::Authentication(_)
                | Error::Authorization(_)
                | Error::NotFound { .. }
                | Error::Configuration(_)
        )
    }

    /// Errors that count as a failed connection outcome for a server.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Upstream { .. } | Error::Timeout { .. } | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(Error::BadRequest("vmid".into()).http_status(), 400);
        assert_eq!(Error::Authentication("expired".into()).http_status(), 401);
        assert_eq!(Error::Authorization("console".into()).http_status(), 403);
        assert_eq!(Error::not_found("server", 7).http_status(), 404);
        assert_eq!(Error::Timeout { ms: 5000 }.http_status(), 500);
        assert_eq!(
            Error::Upstream { status: Some(596), body: "tls".into() }.http_status(),
            500
        );
    }

    #[test]
    fn test_upstream_display() {
        let e = Error::Upstream { status: Some(401), body: "no ticket".into() };
        assert_eq!(e.to_string(), "Upstream error (HTTP 401): no ticket");
        let e = Error::Upstream { status: None, body: "connection refused".into() };
        assert_eq!(e.to_string(), "Upstream error: connection refused");
    }

    #[test]
    fn test_classification() {
        assert!(Error::Configuration("server disabled".into()).is_terminal());
        assert!(!Error::Timeout { ms: 1 }.is_terminal());
        assert!(Error::Timeout { ms: 1 }.is_connection_failure());
        assert!(!Error::Authorization("x".into()).is_connection_failure());
    }
}
