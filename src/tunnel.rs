//! Frame tunnel between the enclave's TAP device and the host proxy
//!
//! The supervisor keeps exactly one connection attempt alive at a time:
//!
//! ```text
//!   Idle ──▶ Establishing ──▶ Forwarding ──▶ Closing (stop requested)
//!    ▲            │                │
//!    │            ▼                ▼
//!    └──(1s)── Failed ◀────────────┘
//! ```
//!
//! Each attempt creates the TAP device, dials the host, sends the handshake,
//! configures the link, and then runs two forwarding tasks that share a
//! single-slot error channel. The first error tears the attempt down; only a
//! stop request ends the supervisor.

use crate::config::TunnelConfig;
use crate::device::{FrameDevice, KernelStack, NetworkStack};
use crate::error::{EnclaveError, Result};
use crate::frame::FrameCodec;
use crate::vsock_transport::{send_handshake, BoxedStream, Dialer, HostEndpoint, StreamDialer};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    Establishing,
    Forwarding,
    Closing,
    Failed,
}

/// Single-slot error channel shared by the forwarding tasks.
///
/// The first report wins; later reports are dropped without blocking.
#[derive(Debug, Clone)]
pub struct ErrorSlot {
    tx: mpsc::Sender<EnclaveError>,
}

impl ErrorSlot {
    pub fn new() -> (Self, mpsc::Receiver<EnclaveError>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Returns whether `err` took the slot
    pub fn report(&self, err: EnclaveError) -> bool {
        match self.tx.try_send(err) {
            Ok(()) => true,
            Err(rejected) => {
                debug!(error = %rejected.into_inner(), "Dropping error, slot already taken");
                false
            }
        }
    }
}

/// The device and host connection owned by one attempt
struct Session<Dev> {
    device: Arc<Dev>,
    stream: BoxedStream,
}

enum Step<Dev> {
    Idle,
    Establishing,
    Forwarding(Session<Dev>),
    Closing,
    Failed(EnclaveError),
}

impl<Dev> Step<Dev> {
    fn state(&self) -> TunnelState {
        match self {
            Step::Idle => TunnelState::Idle,
            Step::Establishing => TunnelState::Establishing,
            Step::Forwarding(_) => TunnelState::Forwarding,
            Step::Closing => TunnelState::Closing,
            Step::Failed(_) => TunnelState::Failed,
        }
    }
}

/// Supervises the tunnel to the host
pub struct Tunnel<D = StreamDialer, N = KernelStack> {
    config: TunnelConfig,
    dialer: D,
    stack: N,
    events: Option<mpsc::UnboundedSender<TunnelState>>,
}

impl Tunnel {
    /// Creates a tunnel that dials vsock/TCP and drives a kernel TAP device
    pub fn new(config: TunnelConfig) -> Self {
        Self::with_parts(config, StreamDialer, KernelStack)
    }
}

impl<D: Dialer, N: NetworkStack> Tunnel<D, N> {
    pub fn with_parts(config: TunnelConfig, dialer: D, stack: N) -> Self {
        Self {
            config,
            dialer,
            stack,
            events: None,
        }
    }

    /// Publishes every state transition on `events`
    pub fn with_state_events(mut self, events: mpsc::UnboundedSender<TunnelState>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Runs until `stop` is cancelled, reconnecting after every failure.
    ///
    /// Only an invalid configuration makes this return an error.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        self.config.validate()?;
        info!(endpoint = %self.config.endpoint, "Starting tunnel to host");

        let mut step = Step::Idle;
        loop {
            self.publish(step.state());
            step = match step {
                Step::Idle if stop.is_cancelled() => Step::Closing,
                Step::Idle => Step::Establishing,
                Step::Establishing => {
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => Step::Closing,
                        result = self.establish() => match result {
                            Ok(session) => Step::Forwarding(session),
                            Err(e) => Step::Failed(e),
                        },
                    }
                }
                Step::Forwarding(session) => match self.forward(session, &stop).await {
                    Ok(()) => Step::Closing,
                    Err(e) => Step::Failed(e),
                },
                Step::Failed(e) => {
                    warn!(
                        error = %e,
                        retryable = e.is_retryable(),
                        backoff_ms = self.config.backoff.as_millis(),
                        "Tunnel to host failed, restarting"
                    );
                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => Step::Closing,
                        _ = tokio::time::sleep(self.config.backoff) => Step::Idle,
                    }
                }
                Step::Closing => {
                    info!("Shutting down networking");
                    return Ok(());
                }
            };
        }
    }

    fn publish(&self, state: TunnelState) {
        debug!(state = ?state, "Tunnel state");
        if let Some(events) = &self.events {
            let _ = events.send(state);
        }
    }

    /// Creates the device, connects, and configures the link
    async fn establish(&self) -> Result<Session<N::Device>> {
        info!("Setting up networking between host and enclave");

        let device = self.stack.create_device(&self.config).await?;

        let mut stream = self.dialer.dial(&self.config.endpoint).await?;
        info!(endpoint = %self.config.endpoint, "Established connection with host");
        send_handshake(&mut stream, &self.config.endpoint).await?;

        self.stack.configure(&self.config).await?;
        self.stack.link_up(&self.config).await?;

        Ok(Session {
            device: Arc::new(device),
            stream,
        })
    }

    /// Forwards traffic until one direction fails or `stop` fires
    async fn forward(&self, session: Session<N::Device>, stop: &CancellationToken) -> Result<()> {
        let max_frame_len = self.config.max_frame_len();
        let (reader, writer) = tokio::io::split(session.stream);
        let (slot, mut errors) = ErrorSlot::new();

        let mut tasks = JoinSet::new();
        tasks.spawn(device_to_host(
            Arc::clone(&session.device),
            FramedWrite::new(writer, FrameCodec::new(max_frame_len)),
            max_frame_len,
            slot.clone(),
        ));
        tasks.spawn(host_to_device(
            FramedRead::new(reader, FrameCodec::new(max_frame_len)),
            Arc::clone(&session.device),
            slot,
        ));
        info!("Started tasks to forward traffic");

        let result = tokio::select! {
            err = errors.recv() => Err(err.unwrap_or_else(|| {
                EnclaveError::Transport("forwarding tasks exited without reporting".to_string())
            })),
            _ = stop.cancelled() => Ok(()),
        };

        tasks.shutdown().await;
        info!("Tearing down networking between host and enclave");
        result
    }
}

/// Runs the tunnel with default settings for `endpoint` until `stop` fires
pub async fn start_tunnel(endpoint: HostEndpoint, stop: CancellationToken) -> Result<()> {
    Tunnel::new(TunnelConfig::new(endpoint)).run(stop).await
}

/// Reads frames from the device and writes them to the host
pub(crate) async fn device_to_host<Dev, W>(
    device: Arc<Dev>,
    mut sink: FramedWrite<W, FrameCodec>,
    max_frame_len: usize,
    slot: ErrorSlot,
) where
    Dev: FrameDevice,
    W: AsyncWrite + Unpin,
{
    debug!("Waiting for frames from enclave application");
    let mut buf = vec![0u8; max_frame_len];

    let err = loop {
        let n = match device.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                break EnclaveError::Transport(format!("failed to read frame from TAP device: {}", e))
            }
        };
        if let Err(e) = sink.send(Bytes::copy_from_slice(&buf[..n])).await {
            break with_context(e, "failed to write frame to connection");
        }
    };
    slot.report(err);
}

/// Reads frames from the host and injects them into the device
pub(crate) async fn host_to_device<Dev, R>(
    mut frames: FramedRead<R, FrameCodec>,
    device: Arc<Dev>,
    slot: ErrorSlot,
) where
    Dev: FrameDevice,
    R: AsyncRead + Unpin,
{
    debug!("Waiting for frames from host");

    let err = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break with_context(e, "failed to read frame from connection"),
            None => break EnclaveError::Transport("host closed the connection".to_string()),
        };
        if frame.is_empty() {
            debug!("Skipping empty frame");
            continue;
        }
        if let Err(e) = device.send(&frame).await {
            break EnclaveError::Transport(format!("failed to write frame to TAP device: {}", e));
        }
    };
    slot.report(err);
}

fn with_context(err: EnclaveError, context: &str) -> EnclaveError {
    match err {
        EnclaveError::Io(e) => EnclaveError::Transport(format!("{}: {}", context, e)),
        other => other,
    }
}
