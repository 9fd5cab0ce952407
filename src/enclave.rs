//! Attestation document requests through the Nitro Secure Module
//!
//! The NSM is the only component that can produce a signed attestation
//! document for this enclave. Outside an enclave the device does not exist
//! and every request fails with `AttestationUnavailable`.

use crate::error::{EnclaveError, Result};
use aws_nitro_enclaves_nsm_api::api::{Request, Response};
use aws_nitro_enclaves_nsm_api::driver::{nsm_exit, nsm_init, nsm_process_request};
use serde_bytes::ByteBuf;
use tracing::{debug, info};

/// Values to bind into a new attestation document; each is optional
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentRequest {
    pub nonce: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
}

impl DocumentRequest {
    /// Request binding only a freshness nonce
    pub fn with_nonce(nonce: &[u8]) -> Self {
        Self {
            nonce: Some(nonce.to_vec()),
            ..Default::default()
        }
    }
}

/// Produces raw signed attestation documents
pub trait AttestationSource: Send + Sync {
    fn request_document(&self, request: &DocumentRequest) -> Result<Vec<u8>>;
}

/// An open session with the Nitro Secure Module
#[derive(Debug)]
pub struct NsmAttester {
    fd: i32,
}

impl NsmAttester {
    /// Opens the NSM device
    pub fn open() -> Result<Self> {
        let fd = nsm_init();
        if fd < 0 {
            return Err(EnclaveError::AttestationUnavailable(
                "Failed to open the Nitro Secure Module".to_string(),
            ));
        }
        info!("NSM initialized successfully, running in enclave mode");
        Ok(Self { fd })
    }
}

impl AttestationSource for NsmAttester {
    fn request_document(&self, request: &DocumentRequest) -> Result<Vec<u8>> {
        let nsm_request = Request::Attestation {
            user_data: request.user_data.clone().map(ByteBuf::from),
            nonce: request.nonce.clone().map(ByteBuf::from),
            public_key: request.public_key.clone().map(ByteBuf::from),
        };

        match nsm_process_request(self.fd, nsm_request) {
            Response::Attestation { document } => {
                debug!(document_len = document.len(), "Received attestation document");
                Ok(document)
            }
            Response::Error(err) => Err(EnclaveError::AttestationRequestFailed(format!(
                "Failed to get attestation: {:?}",
                err
            ))),
            _ => Err(EnclaveError::AttestationRequestFailed(
                "Unexpected NSM response".to_string(),
            )),
        }
    }
}

impl Drop for NsmAttester {
    fn drop(&mut self) {
        nsm_exit(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_with_nonce() {
        let request = DocumentRequest::with_nonce(b"N1");
        assert_eq!(request.nonce.as_deref(), Some(&b"N1"[..]));
        assert!(request.user_data.is_none());
        assert!(request.public_key.is_none());
    }

    #[test]
    fn test_nsm_unavailable_outside_enclave() {
        match NsmAttester::open() {
            Err(err) => assert!(matches!(err, EnclaveError::AttestationUnavailable(_))),
            Ok(attester) => {
                // Running inside an enclave: a request must produce a document.
                let document = attester
                    .request_document(&DocumentRequest::with_nonce(b"probe"))
                    .unwrap();
                assert!(!document.is_empty());
            }
        }
    }
}
