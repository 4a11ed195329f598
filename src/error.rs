//! Error types for the Argus Kubernetes Operator

use std::fmt;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while routing and executing commands
#[derive(Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    KubeApi(String),
    /// Configuration error (fatal at startup)
    Configuration(String),
    /// HTTP call to a downstream service failed
    Http(String),
    /// Serialization error
    Serialization(String),
    /// Resource not found
    NotFound(String),
    /// Command envelope is malformed or targets nothing
    InvalidCommand(String),
    /// Registry rejected our credentials during enumeration
    RegistryAuth(String),
    /// The worker pool has no capacity for another job
    Overloaded(String),
    /// The component that would serve this command is disabled in config
    Disabled(&'static str),
}

impl fmt::Display for OperatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorError::KubeApi(msg) => write!(f, "Kubernetes API error: {}", msg),
            OperatorError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            OperatorError::Http(msg) => write!(f, "HTTP error: {}", msg),
            OperatorError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            OperatorError::NotFound(msg) => write!(f, "Resource not found: {}", msg),
            OperatorError::InvalidCommand(msg) => write!(f, "Invalid command: {}", msg),
            OperatorError::RegistryAuth(msg) => write!(f, "Registry authentication failed: {}", msg),
            OperatorError::Overloaded(msg) => write!(f, "Worker pool overloaded: {}", msg),
            OperatorError::Disabled(component) => write!(f, "{} is not enabled", component),
        }
    }
}

impl std::error::Error for OperatorError {}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OperatorError {
    fn from(err: reqwest::Error) -> Self {
        OperatorError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));
    }

    #[test]
    fn test_disabled_names_component() {
        let err = OperatorError::Disabled("PolicyScanScheduler");
        assert_eq!(err.to_string(), "PolicyScanScheduler is not enabled");
    }

    #[test]
    fn test_error_variants() {
        let errors = vec![
            OperatorError::KubeApi("api".to_string()),
            OperatorError::Configuration("config".to_string()),
            OperatorError::Http("http".to_string()),
            OperatorError::Serialization("serde".to_string()),
            OperatorError::NotFound("resource".to_string()),
            OperatorError::InvalidCommand("empty id".to_string()),
            OperatorError::RegistryAuth("unauthorized".to_string()),
            OperatorError::Disabled("ImageScanScheduler"),
        ];

        for err in errors {
            // Ensure Display is implemented
            let _ = format!("{}", err);
        }
    }
}
