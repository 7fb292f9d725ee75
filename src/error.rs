//! Error types for the guardian engine

use thiserror::Error;

use crate::guardian::approval::ApprovalStatus;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the guardian engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid policy configuration: {0}")]
    ConfigInvalid(String),

    // Structural request errors (rejected back to the caller)
    #[error("Invalid action request: {0}")]
    InvalidActionRequest(String),

    #[error("Missing required scope id: {0}")]
    MissingScope(&'static str),

    // Signal layer errors (absorbed at the client boundary)
    #[error("Layer {layer} unreachable: {reason}")]
    LayerUnreachable { layer: String, reason: String },

    #[error("Layer {layer} timed out after {timeout_ms}ms")]
    LayerTimeout { layer: String, timeout_ms: u64 },

    #[error("Layer {layer} rejected credentials (HTTP {status})")]
    LayerAuth { layer: String, status: u16 },

    #[error("Malformed response from layer {layer}: {reason}")]
    LayerMalformed { layer: String, reason: String },

    // Approval workflow errors
    #[error("Unknown approval request: {0}")]
    UnknownApprovalRequest(String),

    #[error("Approval request {id} already resolved as {status}")]
    RequestAlreadyTerminal { id: String, status: ApprovalStatus },

    #[error("Guardian {guardian_id} is not eligible to vote on {request_id}")]
    GuardianNotEligible {
        request_id: String,
        guardian_id: String,
    },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is transient (a later attempt may succeed)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LayerUnreachable { .. } | Error::LayerTimeout { .. } | Error::Io(_)
        )
    }

    /// Check if this error was caused by the caller's input rather than the engine
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidActionRequest(_)
                | Error::MissingScope(_)
                | Error::UnknownApprovalRequest(_)
                | Error::RequestAlreadyTerminal { .. }
                | Error::GuardianNotEligible { .. }
        )
    }

    /// Short machine-readable code used in API envelopes and audit records
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) | Error::ConfigInvalid(_) => "config_invalid",
            Error::InvalidActionRequest(_) => "invalid_action_request",
            Error::MissingScope(_) => "missing_scope",
            Error::LayerUnreachable { .. }
            | Error::LayerTimeout { .. }
            | Error::LayerAuth { .. }
            | Error::LayerMalformed { .. } => "layer_unreachable",
            Error::UnknownApprovalRequest(_) => "unknown_approval_request",
            Error::RequestAlreadyTerminal { .. } => "request_already_terminal",
            Error::GuardianNotEligible { .. } => "guardian_not_eligible",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Internal(_) | Error::Anyhow(_) => "internal",
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Conversion from config crate errors
impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::ConfigInvalid(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_errors() {
        assert!(Error::MissingScope("wallet_id").is_caller_error());
        assert!(Error::UnknownApprovalRequest("x".into()).is_caller_error());
        assert!(!Error::Internal("boom".into()).is_caller_error());
    }

    #[test]
    fn test_retryable() {
        let err = Error::LayerTimeout {
            layer: "sentinel".into(),
            timeout_ms: 800,
        };
        assert!(err.is_retryable());
        assert_eq!(err.code(), "layer_unreachable");
        assert!(!Error::ConfigInvalid("bad".into()).is_retryable());
    }

    #[test]
    fn test_terminal_message() {
        let err = Error::RequestAlreadyTerminal {
            id: "req-1".into(),
            status: ApprovalStatus::Expired,
        };
        assert_eq!(
            err.to_string(),
            "Approval request req-1 already resolved as EXPIRED"
        );
    }
}
