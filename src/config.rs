//! Process configuration
//!
//! Defaults match the host proxy setup on the parent instance. Every value
//! can be overridden through an `ENCLAVE_*` environment variable.

use crate::error::{EnclaveError, Result};
use crate::frame::{DEFAULT_MTU, ETHERNET_HEADER_LEN, MAX_FRAME_LEN};
use crate::vsock_transport::HostEndpoint;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// DEFAULT CONFIGURATION - must agree with the host proxy on the parent
// =============================================================================

/// Name of the TAP device inside the enclave
pub const TAP_NAME: &str = "tap0";

/// Enclave address on the virtual network
pub const TAP_ADDRESS: &str = "192.168.127.2/24";

/// Host proxy address on the virtual network, used as default gateway and DNS
pub const GATEWAY: &str = "192.168.127.1";

/// Hardware address of the TAP device
pub const TAP_MAC: &str = "5a:94:ef:e4:0c:ee";

pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Wait between failed connection attempts
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Open file descriptor limits requested at startup
pub const FD_LIMIT: u64 = 65536;

/// Length of generated attestation nonces
pub const NONCE_LEN: usize = 32;

/// SHA-256 fingerprint of the AWS Nitro Enclaves root certificate (G1)
pub const NITRO_ROOT_CERT_SHA256: &str =
    "641a0321a3e244efe456463195d606317ed7cdcc3c1756e09893f3c68f79bb5b";

// =============================================================================

const MIN_MTU: usize = 68;

/// An IPv4 address with prefix length, e.g. `192.168.127.2/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

impl FromStr for InterfaceAddress {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EnclaveError::Config(format!("Invalid interface address {:?}", s));
        let (ip, prefix_len) = s.split_once('/').ok_or_else(invalid)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix_len.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        Ok(Self { ip, prefix_len })
    }
}

impl std::fmt::Display for InterfaceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

/// Parses a colon-separated hardware address
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let invalid = || EnclaveError::Config(format!("Invalid MAC address {:?}", s));
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 {
            return Err(invalid());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(mac)
}

/// Configuration for the frame tunnel
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Host proxy endpoint
    pub endpoint: HostEndpoint,
    /// TAP device name
    pub tap_name: String,
    /// Interface MTU (frames may carry an extra Ethernet header)
    pub mtu: usize,
    /// Interface address with prefix
    pub address: InterfaceAddress,
    /// Default gateway
    pub gateway: Ipv4Addr,
    /// Hardware address; the kernel picks one when unset
    pub mac: Option<String>,
    /// Content written to the resolver file
    pub resolv_conf: String,
    pub resolv_conf_path: String,
    /// Wait between failed attempts
    pub backoff: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            endpoint: HostEndpoint::default(),
            tap_name: TAP_NAME.to_string(),
            mtu: DEFAULT_MTU,
            address: InterfaceAddress {
                ip: Ipv4Addr::new(192, 168, 127, 2),
                prefix_len: 24,
            },
            gateway: Ipv4Addr::new(192, 168, 127, 1),
            mac: Some(TAP_MAC.to_string()),
            resolv_conf: format!("nameserver {}\n", GATEWAY),
            resolv_conf_path: RESOLV_CONF_PATH.to_string(),
            backoff: RECONNECT_BACKOFF,
        }
    }
}

impl TunnelConfig {
    /// Creates a tunnel config for the given endpoint
    pub fn new(endpoint: HostEndpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Largest frame the device can hand us
    pub fn max_frame_len(&self) -> usize {
        self.mtu.saturating_add(ETHERNET_HEADER_LEN)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > MAX_FRAME_LEN - ETHERNET_HEADER_LEN {
            return Err(EnclaveError::Config(format!(
                "MTU {} outside {}..={}",
                self.mtu,
                MIN_MTU,
                MAX_FRAME_LEN - ETHERNET_HEADER_LEN
            )));
        }
        if self.tap_name.is_empty() || self.tap_name.len() > 15 {
            return Err(EnclaveError::Config(format!(
                "Invalid TAP device name {:?}",
                self.tap_name
            )));
        }
        if let Some(mac) = &self.mac {
            parse_mac(mac)?;
        }
        Ok(())
    }
}

/// Configuration for attestation
#[derive(Debug, Clone)]
pub struct AttestationConfig {
    /// Run the cross-attestation check once at startup
    pub self_check: bool,
    /// Length of generated nonces
    pub nonce_len: usize,
    /// Hex SHA-256 fingerprint of the trusted root certificate
    pub root_cert_sha256: String,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            self_check: true,
            nonce_len: NONCE_LEN,
            root_cert_sha256: NITRO_ROOT_CERT_SHA256.to_string(),
        }
    }
}

impl AttestationConfig {
    /// Decoded root fingerprint
    pub fn root_fingerprint(&self) -> Result<[u8; 32]> {
        let bytes = hex::decode(&self.root_cert_sha256)
            .map_err(|e| EnclaveError::Config(format!("Invalid root fingerprint: {}", e)))?;
        bytes
            .try_into()
            .map_err(|_| EnclaveError::Config("Root fingerprint must be 32 bytes".to_string()))
    }
}

/// Complete process configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub tunnel: TunnelConfig,
    pub attestation: AttestationConfig,
    /// Log level name (`error`, `warn`, `info`, `debug`, `trace`)
    pub log_level: String,
    pub fd_limit: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            attestation: AttestationConfig::default(),
            log_level: "info".to_string(),
            fd_limit: FD_LIMIT,
        }
    }
}

impl BridgeConfig {
    /// Loads the configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let tunnel = &mut config.tunnel;
        if let Some(endpoint) = lookup("ENCLAVE_HOST_ENDPOINT") {
            tunnel.endpoint = endpoint.parse()?;
        }
        if let Some(name) = lookup("ENCLAVE_TAP_NAME") {
            tunnel.tap_name = name;
        }
        if let Some(mtu) = lookup("ENCLAVE_MTU") {
            tunnel.mtu = parse_number("ENCLAVE_MTU", &mtu)?;
        }
        if let Some(address) = lookup("ENCLAVE_TAP_ADDRESS") {
            tunnel.address = address.parse()?;
        }
        if let Some(gateway) = lookup("ENCLAVE_GATEWAY") {
            tunnel.gateway = gateway
                .parse()
                .map_err(|_| EnclaveError::Config(format!("Invalid gateway {:?}", gateway)))?;
        }
        if let Some(mac) = lookup("ENCLAVE_TAP_MAC") {
            tunnel.mac = if mac.is_empty() { None } else { Some(mac) };
        }
        if let Some(nameserver) = lookup("ENCLAVE_NAMESERVER") {
            tunnel.resolv_conf = format!("nameserver {}\n", nameserver);
        }
        if let Some(path) = lookup("ENCLAVE_RESOLV_CONF") {
            tunnel.resolv_conf_path = path;
        }
        if let Some(ms) = lookup("ENCLAVE_BACKOFF_MS") {
            tunnel.backoff = Duration::from_millis(parse_number("ENCLAVE_BACKOFF_MS", &ms)?);
        }

        let attestation = &mut config.attestation;
        if let Some(flag) = lookup("ENCLAVE_SELF_ATTEST") {
            attestation.self_check = !matches!(flag.as_str(), "0" | "false" | "no");
        }
        if let Some(len) = lookup("ENCLAVE_NONCE_LEN") {
            attestation.nonce_len = parse_number("ENCLAVE_NONCE_LEN", &len)?;
        }
        if let Some(fingerprint) = lookup("ENCLAVE_ROOT_CERT_SHA256") {
            attestation.root_cert_sha256 = fingerprint;
        }

        if let Some(level) = lookup("ENCLAVE_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(limit) = lookup("ENCLAVE_FD_LIMIT") {
            config.fd_limit = parse_number("ENCLAVE_FD_LIMIT", &limit)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.attestation.root_fingerprint()?;
        self.log_level.parse::<tracing::Level>().map_err(|_| {
            EnclaveError::Config(format!("Invalid log level {:?}", self.log_level))
        })?;
        if self.attestation.nonce_len == 0 || self.attestation.nonce_len > 1024 {
            return Err(EnclaveError::Config(format!(
                "Nonce length {} outside 1..=1024",
                self.attestation.nonce_len
            )));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| EnclaveError::Config(format!("{} must be a number, got {:?}", key, value)))
}
