use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DemError>;

#[derive(Error, Debug)]
pub enum DemError {
    #[error("No stored credentials, run again to enter them")]
    CredentialsMissing,

    #[error("Unable to decrypt stored credentials: {0}")]
    DecryptionFailed(String),

    #[error("The two secret entries do not match")]
    SecretMismatch,

    #[error("Key pair error: {0}")]
    Crypto(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("No token has been issued yet")]
    NotAuthenticated,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Token budget exhausted after {refreshes} refreshes and {elapsed:?}")]
    TokenBudgetExhausted { refreshes: u32, elapsed: Duration },

    #[error("Tile geometry index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Unknown MGRS tile: {0}")]
    UnknownTile(String),

    #[error("Malformed work list entry at line {line}: '{entry}'")]
    MalformedWorkList { line: usize, entry: String },

    #[error("No product found for {0}")]
    NotFound(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Extraction failed: {0}")]
    Extract(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DemError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DemError::Network(_))
    }

    /// Maps an unsuccessful HTTP status onto the error taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let message = format!("{context}: HTTP {status}");
        match status.as_u16() {
            401 | 403 => DemError::AuthRejected(message),
            404 => DemError::NotFound(message),
            502 | 504 => DemError::Network(message),
            _ => DemError::ServiceUnavailable(message),
        }
    }
}

impl From<reqwest::Error> for DemError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            DemError::Network(err.to_string())
        } else if let Some(status) = err.status() {
            DemError::from_status(status, "request failed")
        } else {
            DemError::ServiceUnavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            DemError::from_status(StatusCode::UNAUTHORIZED, "x"),
            DemError::AuthRejected(_)
        ));
        assert!(matches!(
            DemError::from_status(StatusCode::NOT_FOUND, "x"),
            DemError::NotFound(_)
        ));
        assert!(matches!(
            DemError::from_status(StatusCode::SERVICE_UNAVAILABLE, "x"),
            DemError::ServiceUnavailable(_)
        ));
        assert!(DemError::from_status(StatusCode::GATEWAY_TIMEOUT, "x").is_retryable());
    }

    #[test]
    fn test_only_network_is_retryable() {
        assert!(DemError::Network("reset".into()).is_retryable());
        assert!(!DemError::ServiceUnavailable("down".into()).is_retryable());
        assert!(!DemError::AuthRejected("bad".into()).is_retryable());
        assert!(!DemError::NotFound("N45E008".into()).is_retryable());
    }
}
