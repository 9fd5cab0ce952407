//! Stream transport to the parent instance
//!
//! The enclave has no network interface of its own. All traffic leaves
//! through a single vsock stream to a proxy on the parent EC2 instance, which
//! switches the stream into raw frame mode after a one-shot HTTP request.
//!
//! ```text
//! ┌─────────────────┐  vsock   ┌─────────────────┐         ┌──────────┐
//! │  Enclave        │─────────▶│  Parent EC2     │────────▶│ Internet │
//! │  tap0 (frames)  │  frames  │  (host proxy)   │         │          │
//! └─────────────────┘          └─────────────────┘         └──────────┘
//! ```
//!
//! A `tcp://` endpoint is accepted as well so the tunnel can be exercised
//! outside an enclave.

use crate::error::{EnclaveError, Result};
use hyper::header::{CONTENT_LENGTH, HOST};
use hyper::{Method, Request};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// CID for the parent/host instance in vsock
pub const VSOCK_CID_HOST: u32 = 3;

/// Port the host proxy listens on (must match the proxy config on the parent)
pub const HOST_PROXY_PORT: u32 = 1024;

/// Request path that switches the host proxy into frame mode
pub const HANDSHAKE_PATH: &str = "/connect";

/// Address of the host proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    Vsock { cid: u32, port: u32 },
    Tcp { host: String, port: u16 },
}

/// Host proxy address plus the handshake path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub addr: HostAddr,
    pub path: String,
}

impl Default for HostEndpoint {
    fn default() -> Self {
        Self::vsock(VSOCK_CID_HOST, HOST_PROXY_PORT)
    }
}

impl HostEndpoint {
    /// Creates a vsock endpoint with the default handshake path
    pub fn vsock(cid: u32, port: u32) -> Self {
        Self {
            addr: HostAddr::Vsock { cid, port },
            path: HANDSHAKE_PATH.to_string(),
        }
    }

    /// Creates a TCP endpoint with the default handshake path
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            addr: HostAddr::Tcp {
                host: host.into(),
                port,
            },
            path: HANDSHAKE_PATH.to_string(),
        }
    }

    /// `<cid>:<port>` or `<host>:<port>`, used as the handshake Host header
    pub fn authority(&self) -> String {
        match &self.addr {
            HostAddr::Vsock { cid, port } => format!("{}:{}", cid, port),
            HostAddr::Tcp { host, port } => format!("{}:{}", host, port),
        }
    }
}

impl fmt::Display for HostEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.addr {
            HostAddr::Vsock { .. } => "vsock",
            HostAddr::Tcp { .. } => "tcp",
        };
        write!(f, "{}://{}{}", scheme, self.authority(), self.path)
    }
}

impl FromStr for HostEndpoint {
    type Err = EnclaveError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| EnclaveError::Config(format!("Invalid endpoint {:?}: {}", s, reason));

        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], rest[idx..].to_string()),
            None => (rest, HANDSHAKE_PATH.to_string()),
        };
        let (host, port) = authority
            .rsplit_once(':')
            .ok_or_else(|| invalid("missing port"))?;

        let addr = match scheme {
            "vsock" => HostAddr::Vsock {
                cid: host.parse().map_err(|_| invalid("CID is not a number"))?,
                port: port.parse().map_err(|_| invalid("port is not a number"))?,
            },
            "tcp" => {
                if host.is_empty() {
                    return Err(invalid("empty host"));
                }
                HostAddr::Tcp {
                    host: host.to_string(),
                    port: port.parse().map_err(|_| invalid("port is not a number"))?,
                }
            }
            other => return Err(invalid(&format!("unsupported scheme {:?}", other))),
        };

        Ok(Self { addr, path })
    }
}

/// A duplex byte stream to the host
pub trait HostStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HostStream for T {}

pub type BoxedStream = Box<dyn HostStream>;

/// Opens stream connections to the host
pub trait Dialer: Send + Sync {
    fn dial(&self, endpoint: &HostEndpoint) -> impl Future<Output = Result<BoxedStream>> + Send;
}

/// Dials vsock or TCP endpoints
#[derive(Debug, Clone, Default)]
pub struct StreamDialer;

impl Dialer for StreamDialer {
    fn dial(&self, endpoint: &HostEndpoint) -> impl Future<Output = Result<BoxedStream>> + Send {
        let addr = endpoint.addr.clone();
        async move {
            match addr {
                HostAddr::Vsock { cid, port } => dial_vsock(cid, port).await,
                HostAddr::Tcp { host, port } => {
                    let stream = tokio::net::TcpStream::connect((host.as_str(), port))
                        .await
                        .map_err(|e| {
                            EnclaveError::Transport(format!(
                                "Failed to connect to {}:{}: {}",
                                host, port, e
                            ))
                        })?;
                    Ok(Box::new(stream) as BoxedStream)
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
async fn dial_vsock(cid: u32, port: u32) -> Result<BoxedStream> {
    use tokio_vsock::{VsockAddr, VsockStream};

    let stream = VsockStream::connect(VsockAddr::new(cid, port))
        .await
        .map_err(|e| {
            EnclaveError::Transport(format!(
                "Failed to connect to vsock {}:{}: {}",
                cid, port, e
            ))
        })?;
    Ok(Box::new(stream))
}

/// Fallback for non-Linux platforms (development mode)
#[cfg(not(target_os = "linux"))]
async fn dial_vsock(_cid: u32, _port: u32) -> Result<BoxedStream> {
    Err(EnclaveError::Transport(
        "vsock transport is only available on Linux inside a Nitro enclave. \
         Use a tcp:// endpoint for local development."
            .to_string(),
    ))
}

/// Sends the request that switches the host stream into frame mode.
///
/// The host reads the request head and then treats everything that follows
/// as frames; no response is sent back.
pub async fn send_handshake<S>(stream: &mut S, endpoint: &HostEndpoint) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    let request = Request::builder()
        .method(Method::POST)
        .uri(endpoint.path.as_str())
        .header(HOST, endpoint.authority())
        .header(CONTENT_LENGTH, 0)
        .body(())
        .map_err(|e| EnclaveError::Transport(format!("Failed to build handshake request: {}", e)))?;

    let head = encode_request_head(&request);
    stream
        .write_all(&head)
        .await
        .map_err(|e| EnclaveError::Transport(format!("Failed to send handshake to host: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| EnclaveError::Transport(format!("Failed to flush handshake: {}", e)))?;

    debug!(endpoint = %endpoint, bytes = head.len(), "Sent handshake request");
    Ok(())
}

fn encode_request_head(request: &Request<()>) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", request.method(), request.uri()).into_bytes();
    for (name, value) in request.headers() {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}
