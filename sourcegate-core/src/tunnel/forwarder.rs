//! Local listener and forwarding loop of a tunnel.

use super::{SshTunnelConfig, TunnelState};
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Byte stream carried through a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

/// Boxed remote end of one forwarded connection.
pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens remote connections over an established session.
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Opens a stream to `host:port` as seen from the SSH server.
    async fn open(&self, host: &str, port: u16) -> Result<TunnelStream>;

    /// Ends the session. Called once when the tunnel stops.
    async fn shutdown(&self) {}
}

/// Performs the handshake that turns a config into a [`ChannelOpener`].
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    /// Connects and authenticates.
    async fn connect(&self, config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>>;
}

/// One SSH tunnel and its local port.
///
/// Dropping an active tunnel signals the forwarding task to stop; call
/// [`SshTunnel::close`] to wait until the port is actually released.
pub struct SshTunnel {
    config: SshTunnelConfig,
    state: TunnelState,
    local_port: Option<u16>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SshTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTunnel")
            .field("ssh", &self.config.ssh_target())
            .field("remote", &self.config.remote_target())
            .field("state", &self.state)
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl SshTunnel {
    /// Creates an idle tunnel. Nothing is bound until [`SshTunnel::establish`].
    pub fn new(config: SshTunnelConfig) -> Self {
        Self {
            config,
            state: TunnelState::Idle,
            local_port: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> TunnelState {
        self.state
    }

    /// Bound local port while establishing or active.
    pub const fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// The tunnel's configuration.
    pub const fn config(&self) -> &SshTunnelConfig {
        &self.config
    }

    /// Binds the local port, performs the handshake and starts forwarding.
    ///
    /// Any failure, timeout or cancellation moves the tunnel to `Failed`
    /// with the listener already dropped.
    ///
    /// # Errors
    /// Returns `Tunnel` on bind, handshake or timeout failure, `Cancelled`
    /// if `cancel` fires first, and `Tunnel` if the tunnel is not idle
    pub async fn establish(
        &mut self,
        connector: &dyn TunnelConnector,
        handshake_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<u16> {
        if self.state != TunnelState::Idle {
            return Err(SourceGateError::tunnel(format!(
                "cannot establish a tunnel that is {}",
                self.state
            )));
        }
        self.state = TunnelState::Establishing;

        let requested = self.config.local_port.unwrap_or(0);
        let listener = match TcpListener::bind(("127.0.0.1", requested)).await {
            Ok(listener) => listener,
            Err(e) => {
                return Err(self.fail(SourceGateError::tunnel_failed(
                    format!("failed to bind local port {requested}"),
                    e,
                )));
            }
        };
        let port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(e) => {
                drop(listener);
                return Err(self.fail(SourceGateError::tunnel_failed(
                    "failed to read bound local port",
                    e,
                )));
            }
        };
        self.local_port = Some(port);

        tracing::debug!(
            ssh = %self.config.ssh_target(),
            remote = %self.config.remote_target(),
            local_port = port,
            "Establishing SSH tunnel"
        );

        let handshake = tokio::time::timeout(handshake_timeout, connector.connect(&self.config));
        let opener = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SourceGateError::cancelled("SSH handshake")),
            outcome = handshake => match outcome {
                Ok(result) => result,
                Err(_) => Err(SourceGateError::tunnel(format!(
                    "SSH handshake with {} timed out after {}ms",
                    self.config.ssh_target(),
                    handshake_timeout.as_millis()
                ))),
            },
        };

        let opener = match opener {
            Ok(opener) => opener,
            Err(e) => {
                drop(listener);
                return Err(self.fail(e));
            }
        };

        let token = self.cancel.clone();
        let remote_host = self.config.remote_host.clone();
        let remote_port = self.config.remote_port;
        self.task = Some(tokio::spawn(forward_loop(
            listener,
            opener,
            remote_host,
            remote_port,
            token,
        )));
        self.state = TunnelState::Active;

        tracing::info!(
            remote = %self.config.remote_target(),
            local_port = port,
            "SSH tunnel active"
        );
        Ok(port)
    }

    /// Stops forwarding and waits until the local port is released.
    ///
    /// Idempotent. Closing an idle tunnel marks it closed; a failed tunnel
    /// stays failed.
    pub async fn close(&mut self) {
        match self.state {
            TunnelState::Active | TunnelState::Establishing => {
                self.state = TunnelState::Closing;
                self.cancel.cancel();
                if let Some(task) = self.task.take()
                    && let Err(e) = task.await
                {
                    tracing::warn!("SSH tunnel task ended abnormally: {}", e);
                }
                self.local_port = None;
                self.state = TunnelState::Closed;
                tracing::info!(remote = %self.config.remote_target(), "SSH tunnel closed");
            }
            TunnelState::Idle => self.state = TunnelState::Closed,
            TunnelState::Closing | TunnelState::Closed | TunnelState::Failed => {}
        }
    }

    fn fail(&mut self, error: SourceGateError) -> SourceGateError {
        self.state = TunnelState::Failed;
        self.local_port = None;
        tracing::warn!(
            ssh = %self.config.ssh_target(),
            "SSH tunnel failed: {}",
            error
        );
        error
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Creates and establishes a tunnel in one step.
///
/// # Errors
/// Same as [`SshTunnel::establish`]
pub async fn acquire_tunnel(
    config: SshTunnelConfig,
    connector: &dyn TunnelConnector,
    handshake_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<SshTunnel> {
    let mut tunnel = SshTunnel::new(config);
    tunnel
        .establish(connector, handshake_timeout, cancel)
        .await?;
    Ok(tunnel)
}

/// Runs `body` with the local port of a fresh tunnel, closing the tunnel on
/// every exit path.
///
/// Cancelling `cancel` while `body` runs closes the tunnel and returns
/// `Cancelled`.
///
/// # Errors
/// Returns the establishment error, the body's error, or `Cancelled`
pub async fn with_tunnel<F, Fut, T>(
    config: SshTunnelConfig,
    connector: &dyn TunnelConnector,
    handshake_timeout: Duration,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(u16) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tunnel = acquire_tunnel(config, connector, handshake_timeout, cancel).await?;
    let port = tunnel.local_port().ok_or_else(|| {
        SourceGateError::tunnel("active tunnel has no local port")
    })?;

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(SourceGateError::cancelled("tunnelled operation")),
        result = body(port) => result,
    };

    tunnel.close().await;
    outcome
}

async fn forward_loop(
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((local, peer)) => {
                    tracing::debug!(%peer, "Accepted tunnel connection");
                    let opener = Arc::clone(&opener);
                    let host = remote_host.clone();
                    connections.spawn(async move {
                        if let Err(e) = forward_connection(local, opener.as_ref(), &host, remote_port).await {
                            tracing::warn!("Tunnel forwarding error: {}", e);
                        }
                    });
                }
                Err(e) => tracing::warn!("Failed to accept tunnel connection: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
    opener.shutdown().await;
}

async fn forward_connection(
    mut local: TcpStream,
    opener: &dyn ChannelOpener,
    remote_host: &str,
    remote_port: u16,
) -> Result<()> {
    let mut remote = opener.open(remote_host, remote_port).await?;
    tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(|e| SourceGateError::tunnel_failed("forwarding interrupted", e))?;
    Ok(())
}
