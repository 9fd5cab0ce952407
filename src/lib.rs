//! Enclave Bridge - network connectivity and attestation for AWS Nitro Enclaves
//!
//! An enclave has no network interface of its own. This library provides:
//! - A TAP device inside the enclave whose frames are tunneled over vsock
//!   to a host-side proxy (length-prefixed framing, automatic reconnect)
//! - Attestation document requests through the Nitro Secure Module
//! - Verification of attestation documents and cross-attestation checks

pub mod attestation;
pub mod config;
pub mod device;
pub mod enclave;
pub mod error;
pub mod frame;
pub mod nitro;
pub mod tunnel;
pub mod vsock_transport;
