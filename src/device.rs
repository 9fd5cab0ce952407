//! Virtual network device inside the enclave
//!
//! Frames written by the enclave's network stack are read from a TAP device
//! and frames arriving from the host are injected into it. Link setup
//! (address, MTU, default route, hardware address) is done with `ip(8)`,
//! and name resolution points at the host proxy.

use crate::config::{parse_mac, TunnelConfig};
use crate::error::{EnclaveError, Result};
use std::future::Future;
use std::io;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A device that exchanges whole link-layer frames
///
/// Both methods take `&self` so that the two forwarding directions can share
/// one device.
pub trait FrameDevice: Send + Sync + 'static {
    /// Reads one frame into `buf`, returning its length
    fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes one frame
    fn send(&self, frame: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Creates and configures the frame device for one connection attempt
pub trait NetworkStack: Send + Sync {
    type Device: FrameDevice;

    /// Creates the device; it is destroyed when dropped
    fn create_device(
        &self,
        config: &TunnelConfig,
    ) -> impl Future<Output = Result<Self::Device>> + Send;

    /// Assigns address, MTU, default route, and resolver configuration
    fn configure(&self, config: &TunnelConfig) -> impl Future<Output = Result<()>> + Send;

    /// Sets the hardware address, if configured, and brings the link up
    fn link_up(&self, config: &TunnelConfig) -> impl Future<Output = Result<()>> + Send;
}

/// The kernel's network stack, driven through a TAP device and `ip(8)`
#[derive(Debug, Clone, Default)]
pub struct KernelStack;

impl NetworkStack for KernelStack {
    type Device = TapDevice;

    async fn create_device(&self, config: &TunnelConfig) -> Result<TapDevice> {
        let device = TapDevice::open(&config.tap_name)?;
        info!(name = %config.tap_name, "Created TAP device");
        Ok(device)
    }

    async fn configure(&self, config: &TunnelConfig) -> Result<()> {
        for args in configure_commands(config) {
            run_ip(&args).await?;
        }
        write_resolv_conf(config).await?;
        info!(
            name = %config.tap_name,
            address = %config.address,
            gateway = %config.gateway,
            mtu = config.mtu,
            "Configured TAP interface"
        );
        Ok(())
    }

    async fn link_up(&self, config: &TunnelConfig) -> Result<()> {
        if let Some(mac) = &config.mac {
            parse_mac(mac)?;
        }
        for args in link_up_commands(config) {
            run_ip(&args).await?;
        }
        info!(name = %config.tap_name, mac = ?config.mac, "Link is up");
        Ok(())
    }
}

/// `ip` invocations that configure addressing and routing
pub fn configure_commands(config: &TunnelConfig) -> Vec<Vec<String>> {
    let name = config.tap_name.as_str();
    vec![
        args(&["addr", "replace", &config.address.to_string(), "dev", name]),
        args(&["link", "set", "dev", name, "mtu", &config.mtu.to_string()]),
        args(&[
            "route",
            "replace",
            "default",
            "via",
            &config.gateway.to_string(),
            "dev",
            name,
        ]),
    ]
}

/// `ip` invocations that bring the link up
pub fn link_up_commands(config: &TunnelConfig) -> Vec<Vec<String>> {
    let name = config.tap_name.as_str();
    let mut commands = Vec::new();
    if let Some(mac) = &config.mac {
        commands.push(args(&["link", "set", "dev", name, "address", mac]));
    }
    commands.push(args(&["link", "set", "dev", name, "up"]));
    commands
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

async fn run_ip(args: &[String]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| EnclaveError::DeviceConfig(format!("Failed to run ip {}: {}", args.join(" "), e)))?;

    if !output.status.success() {
        return Err(EnclaveError::DeviceConfig(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    debug!(command = %args.join(" "), "ip command succeeded");
    Ok(())
}

/// Points name resolution at the host proxy
pub async fn write_resolv_conf(config: &TunnelConfig) -> Result<()> {
    tokio::fs::write(&config.resolv_conf_path, &config.resolv_conf)
        .await
        .map_err(|e| {
            EnclaveError::DeviceConfig(format!(
                "Failed to write {}: {}",
                config.resolv_conf_path, e
            ))
        })
}

/// Raises the open file descriptor limit
pub fn set_fd_limit(limit: u64) -> Result<()> {
    use nix::sys::resource::{setrlimit, Resource};

    setrlimit(Resource::RLIMIT_NOFILE, limit, limit).map_err(|e| {
        EnclaveError::DeviceConfig(format!("Failed to set file descriptor limit: {}", e))
    })?;
    debug!(limit = limit, "Raised file descriptor limit");
    Ok(())
}

/// Brings up the loopback interface; enclaves boot without one
pub async fn configure_loopback() -> Result<()> {
    run_ip(&args(&["addr", "replace", "127.0.0.1/8", "dev", "lo"])).await?;
    run_ip(&args(&["link", "set", "dev", "lo", "up"])).await?;
    info!("Configured loopback interface");
    Ok(())
}

/// Prepares the enclave for networking.
///
/// A failure to raise the descriptor limit is logged and ignored; a missing
/// loopback interface is fatal.
pub async fn bootstrap(fd_limit: u64) -> Result<()> {
    if let Err(e) = set_fd_limit(fd_limit) {
        warn!(error = %e, "Failed to set new file descriptor limit");
    }
    configure_loopback().await
}

#[cfg(target_os = "linux")]
pub use tap::TapDevice;

#[cfg(target_os = "linux")]
mod tap {
    use super::FrameDevice;
    use crate::error::{EnclaveError, Result};
    use nix::libc;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;

    const TUN_DEVICE: &str = "/dev/net/tun";
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    pub struct IfReq {
        name: [u8; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    nix::ioctl_write_ptr_bad!(
        tun_set_iff,
        nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
        IfReq
    );

    /// A TAP device without packet information headers
    ///
    /// The kernel removes the interface once the descriptor is closed.
    #[derive(Debug)]
    pub struct TapDevice {
        fd: AsyncFd<File>,
    }

    impl TapDevice {
        /// Opens (creating if needed) the TAP interface `name`
        pub fn open(name: &str) -> Result<Self> {
            let name_bytes = name.as_bytes();
            if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
                return Err(EnclaveError::DeviceConfig(format!(
                    "Invalid interface name {:?}",
                    name
                )));
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(TUN_DEVICE)
                .map_err(|e| {
                    EnclaveError::DeviceConfig(format!("Failed to open {}: {}", TUN_DEVICE, e))
                })?;

            let mut req = IfReq {
                name: [0; libc::IFNAMSIZ],
                flags: IFF_TAP | IFF_NO_PI,
                _pad: [0; 22],
            };
            req.name[..name_bytes.len()].copy_from_slice(name_bytes);

            // SAFETY: `req` is a properly sized, initialized ifreq and the
            // descriptor stays open for the duration of the call.
            unsafe { tun_set_iff(file.as_raw_fd(), &req) }.map_err(|e| {
                EnclaveError::DeviceConfig(format!("TUNSETIFF failed for {}: {}", name, e))
            })?;

            let fd = AsyncFd::new(file).map_err(|e| {
                EnclaveError::DeviceConfig(format!("Failed to register TAP device: {}", e))
            })?;
            Ok(Self { fd })
        }
    }

    impl FrameDevice for TapDevice {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| inner.get_ref().read(buf)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, frame: &[u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().write(frame)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_ifreq_layout() {
            assert_eq!(std::mem::size_of::<IfReq>(), 40);
        }

        #[test]
        fn test_rejects_long_name() {
            let err = TapDevice::open("a-very-long-interface-name").unwrap_err();
            assert!(matches!(err, EnclaveError::DeviceConfig(_)));
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback::TapDevice;

/// Fallback for non-Linux platforms (development mode)
#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::FrameDevice;
    use crate::error::{EnclaveError, Result};
    use std::io;

    #[derive(Debug)]
    pub struct TapDevice;

    impl TapDevice {
        pub fn open(_name: &str) -> Result<Self> {
            Err(EnclaveError::DeviceConfig(
                "TAP devices are only available on Linux".to_string(),
            ))
        }
    }

    impl FrameDevice for TapDevice {
        async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no TAP device"))
        }

        async fn send(&self, _frame: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no TAP device"))
        }
    }
}
