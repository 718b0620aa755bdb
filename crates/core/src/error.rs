use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every controller in the workspace.
///
/// Remote failures are classified at the client boundary so callers can
/// decide between "retry", "treat as a state transition" and "log and move on"
/// without inspecting transport details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum FedError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("config: {0}")]
    Config(String),
    #[error("invariant: {0}")]
    Invariant(String),
    #[error("api ({code}): {message}")]
    Api { code: u16, message: String },
    #[error("cancelled")]
    Cancelled,
}

pub type FedResult<T> = Result<T, FedError>;

impl FedError {
    pub fn is_not_found(&self) -> bool { matches!(self, FedError::NotFound(_)) }

    pub fn is_conflict(&self) -> bool { matches!(self, FedError::Conflict(_)) }

    pub fn is_already_exists(&self) -> bool { matches!(self, FedError::AlreadyExists(_)) }

    /// Errors worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            FedError::Conflict(_) | FedError::Transient(_) => true,
            FedError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// Short machine-friendly reason, used for metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            FedError::NotFound(_) => "not_found",
            FedError::AlreadyExists(_) => "already_exists",
            FedError::Conflict(_) => "conflict",
            FedError::Transient(_) => "transient",
            FedError::Config(_) => "config",
            FedError::Invariant(_) => "invariant",
            FedError::Api { .. } => "api",
            FedError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(FedError::Conflict("x".into()).is_retryable());
        assert!(FedError::Transient("x".into()).is_retryable());
        assert!(FedError::Api { code: 503, message: "busy".into() }.is_retryable());
        assert!(FedError::Api { code: 429, message: "slow down".into() }.is_retryable());
        assert!(!FedError::Api { code: 400, message: "bad".into() }.is_retryable());
        assert!(!FedError::NotFound("x".into()).is_retryable());
        assert!(!FedError::Config("x".into()).is_retryable());
    }
}
