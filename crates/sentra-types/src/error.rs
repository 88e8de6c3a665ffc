use serde::{Deserialize, Serialize};

/// Classified failure kinds shared across the engine.
///
/// Classification happens once, at the connector or agent boundary; every
/// layer above routes on the kind instead of re-parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    PermissionDenied,
    Timeout,
    RateLimit,
    CircuitOpen,
    ConnectorNotFound,
    NetworkTransient,
    Server5xx,
    Auth,
    Fatal,
}

impl ErrorKind {
    /// Kinds the execution engine retries with exponential backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::NetworkTransient | ErrorKind::Server5xx
        )
    }

    /// Kinds the registry answers with failover to a homologous connector.
    pub fn triggers_failover(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::NetworkTransient
                | ErrorKind::Server5xx
                | ErrorKind::CircuitOpen
        )
    }

    /// Kinds that escalate the investigation to `requiresReview`.
    pub fn escalates(self) -> bool {
        matches!(self, ErrorKind::Auth | ErrorKind::PermissionDenied)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::ConnectorNotFound => "connector_not_found",
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::Server5xx => "server_5xx",
            ErrorKind::Auth => "auth",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
