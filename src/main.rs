//! Enclave Bridge
//!
//! Runs inside an AWS Nitro Enclave and gives it a network interface.
//!
//! ```text
//!   enclave apps ──► tap0 ──► [len:u16 LE][frame] ──► vsock 3:1024 ──► host proxy
//! ```
//!
//! On startup the enclave raises its descriptor limit, brings up loopback and
//! starts the tunnel to the host. It then optionally verifies its own
//! attestation; the result is logged and never stops the tunnel, which stays
//! up until SIGINT or SIGTERM.
//!
//! Configuration comes from `ENCLAVE_*` environment variables; see
//! `BridgeConfig::from_env`.

use anyhow::Result;
use enclave_bridge::attestation::{Attestor, MeasurementCache, StartupAttestation};
use enclave_bridge::config::{AttestationConfig, BridgeConfig};
use enclave_bridge::device;
use enclave_bridge::enclave::NsmAttester;
use enclave_bridge::nitro::NitroVerifier;
use enclave_bridge::tunnel::Tunnel;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let config = BridgeConfig::from_env()?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.log_level.parse::<Level>()?)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        endpoint = %config.tunnel.endpoint,
        tap = %config.tunnel.tap_name,
        mtu = config.tunnel.mtu,
        "Starting enclave bridge"
    );

    device::bootstrap(config.fd_limit).await?;

    let stop = CancellationToken::new();
    let tunnel = Tunnel::new(config.tunnel.clone());
    let tunnel_stop = stop.clone();
    let mut tunnel_task = tokio::spawn(async move { tunnel.run(tunnel_stop).await });

    let measurements = MeasurementCache::default();
    if config.attestation.self_check {
        let status = run_self_check(config.attestation.clone(), measurements.clone()).await;
        match measurements.get() {
            Some(set) => {
                info!(status = ?status, pcr_count = set.len(), "Local measurements cached")
            }
            None => info!(status = ?status, "No local measurements available"),
        }
    }

    tokio::select! {
        result = &mut tunnel_task => {
            // The tunnel only returns on its own when the configuration is unusable.
            return match result? {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, "Tunnel stopped");
                    Err(e.into())
                }
            };
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    stop.cancel();
    tunnel_task.await??;
    info!("Enclave bridge stopped");
    Ok(())
}

/// Verifies this enclave's own attestation once, while the tunnel runs.
///
/// Outside an enclave there is no NSM and the check is skipped. A failed
/// check is logged; networking keeps running.
async fn run_self_check(config: AttestationConfig, cache: MeasurementCache) -> StartupAttestation {
    let verifier = match NitroVerifier::from_config(&config) {
        Ok(verifier) => verifier,
        Err(e) => {
            error!(error = %e, "Cannot build attestation verifier");
            return StartupAttestation::Failed;
        }
    };

    let check = tokio::task::spawn_blocking(move || match NsmAttester::open() {
        Ok(attester) => {
            Attestor::with_cache(attester, verifier, cache).startup_check(config.nonce_len)
        }
        Err(e) => {
            warn!(error = %e, "NSM not available, skipping self-attestation (local mode)");
            StartupAttestation::Skipped
        }
    });

    match check.await {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "Self-attestation task failed");
            StartupAttestation::Failed
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
