//! Balancer error types.

use thiserror::Error;

/// Errors that can occur in the balancer engine.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Balancer instance not found.
    #[error("balancer '{0}' not found")]
    BalancerNotFound(String),

    /// Backend not found in a balancer.
    #[error("backend '{0}' not found in balancer '{1}'")]
    BackendNotFound(String, String),

    /// Balancer name or backend id already in use.
    #[error("duplicate id '{0}'")]
    DuplicateId(String),

    /// Every candidate backend is unavailable.
    ///
    /// The single "operation cannot proceed" condition for selection;
    /// the caller owns the fallback policy (emergency file, queue, reject).
    #[error("no available backends in balancer '{0}'")]
    NoAvailableBackends(String),

    /// Selection rejected because the balancer is draining before destroy.
    #[error("balancer '{0}' is draining")]
    Draining(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),
}

/// Result type for balancer operations.
pub type BalancerResult<T> = Result<T, BalancerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BalancerError::BalancerNotFound("audio".to_string());
        assert_eq!(err.to_string(), "balancer 'audio' not found");

        let err = BalancerError::BackendNotFound("s1".to_string(), "audio".to_string());
        assert_eq!(err.to_string(), "backend 's1' not found in balancer 'audio'");

        let err = BalancerError::NoAvailableBackends("audio".to_string());
        assert_eq!(err.to_string(), "no available backends in balancer 'audio'");
    }

    #[test]
    fn test_duplicate_id_display() {
        let err = BalancerError::DuplicateId("s1".to_string());
        assert_eq!(err.to_string(), "duplicate id 's1'");
    }
}
