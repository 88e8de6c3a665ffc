use sentra_types::ErrorKind;
use thiserror::Error;

/// Classified connector failure. The kind is assigned once, at the connector
/// boundary; every layer above routes on it.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ConnectorError {
    pub kind: ErrorKind,
    pub message: String,
    /// Populated for `RateLimit`: how long the caller should wait.
    pub retry_after_ms: Option<u64>,
}

impl ConnectorError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            kind: ErrorKind::RateLimit,
            message: format!("rate limited, retry after {retry_after_ms}ms"),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn circuit_open(connector_id: &str) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open for connector {connector_id}"),
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn no_connector(connector_type: &str) -> Self {
        Self::new(
            ErrorKind::ConnectorNotFound,
            format!("no healthy connector of type {connector_type}"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Classify an HTTP status into the shared error taxonomy.
pub fn classify_status(status: u16, retry_after_ms: Option<u64>) -> Option<ConnectorError> {
    match status {
        200..=299 => None,
        401 | 403 => Some(ConnectorError::new(
            ErrorKind::Auth,
            format!("authentication rejected (status {status})"),
        )),
        404 => Some(ConnectorError::new(
            ErrorKind::NotFound,
            "resource not found (status 404)",
        )),
        429 => Some(ConnectorError {
            kind: ErrorKind::RateLimit,
            message: "throttled by upstream (status 429)".to_string(),
            retry_after_ms: Some(retry_after_ms.unwrap_or(1_000)),
        }),
        500..=599 => Some(ConnectorError::new(
            ErrorKind::Server5xx,
            format!("upstream server failure (status {status})"),
        )),
        _ => Some(ConnectorError::new(
            ErrorKind::Validation,
            format!("request rejected (status {status})"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_produce_no_error() {
        assert!(classify_status(200, None).is_none());
        assert!(classify_status(204, None).is_none());
    }

    #[test]
    fn throttle_carries_retry_after() {
        let err = classify_status(429, Some(2_500)).unwrap();
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after_ms, Some(2_500));
    }

    #[test]
    fn auth_statuses_do_not_retry() {
        let err = classify_status(401, None).unwrap();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let err = classify_status(503, None).unwrap();
        assert_eq!(err.kind, ErrorKind::Server5xx);
        assert!(err.is_retryable());
    }
}
