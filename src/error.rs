//! Error types for the enclave bridge

use thiserror::Error;

/// Errors that can occur in the tunnel or during attestation
#[derive(Error, Debug)]
pub enum EnclaveError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Device configuration error: {0}")]
    DeviceConfig(String),

    #[error("Attestation interface unavailable: {0}")]
    AttestationUnavailable(String),

    #[error("Attestation request failed: {0}")]
    AttestationRequestFailed(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Expired certificate: {0}")]
    ExpiredCertificate(String),

    #[error("Malformed attestation document: {0}")]
    MalformedDocument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnclaveError {
    /// Whether the tunnel supervisor should retry after this error.
    ///
    /// Attestation and verification failures are never retried: a document
    /// that failed verification will not become valid on a second look.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EnclaveError::Transport(_)
                | EnclaveError::ProtocolViolation(_)
                | EnclaveError::DeviceConfig(_)
                | EnclaveError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EnclaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(EnclaveError::Transport("refused".into()).is_retryable());
        assert!(EnclaveError::ProtocolViolation("short".into()).is_retryable());
        assert!(EnclaveError::DeviceConfig("tap".into()).is_retryable());
        assert!(!EnclaveError::InvalidSignature("bad".into()).is_retryable());
        assert!(!EnclaveError::ExpiredCertificate("old".into()).is_retryable());
        assert!(!EnclaveError::AttestationUnavailable("nsm".into()).is_retryable());
    }
}
