//! russh-backed [`TunnelConnector`].

use super::forwarder::{ChannelOpener, TunnelConnector, TunnelStream};
use super::{SshAuth, SshTunnelConfig};
use crate::{Result, error::SourceGateError};
use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opens real SSH sessions with russh.
#[derive(Clone, Default)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector").finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Creates a connector with russh's default client settings.
    pub fn new() -> Self {
        Self::default()
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Host keys are not verified; tunnels target operator-chosen bastions.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn connect(&self, config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>> {
        let mut handle = client::connect(
            Arc::clone(&self.config),
            (config.ssh_host.as_str(), config.ssh_port),
            ClientHandler,
        )
        .await
        .map_err(|e| {
            SourceGateError::tunnel_failed(
                format!("failed to connect to SSH server {}", config.ssh_target()),
                e,
            )
        })?;

        let authenticated = match &config.auth {
            SshAuth::Password(password) => handle
                .authenticate_password(config.ssh_user.as_str(), password.as_str())
                .await
                .map_err(|e| SourceGateError::tunnel_failed("SSH password authentication failed", e))?,
            SshAuth::KeyPath(path) => {
                let key = load_private_key(path).await?;
                handle
                    .authenticate_publickey(config.ssh_user.as_str(), key)
                    .await
                    .map_err(|e| SourceGateError::tunnel_failed("SSH key authentication failed", e))?
            }
        };

        if !authenticated {
            return Err(SourceGateError::tunnel(format!(
                "SSH authentication rejected for {}",
                config.ssh_target()
            )));
        }

        tracing::info!(ssh = %config.ssh_target(), "SSH authentication successful");

        Ok(Arc::new(SshChannelOpener {
            handle: Mutex::new(handle),
        }))
    }
}

async fn load_private_key(path: &Path) -> Result<Arc<KeyPair>> {
    let data = tokio::fs::read_to_string(path).await.map_err(|e| {
        SourceGateError::tunnel_failed(format!("failed to read SSH key {}", path.display()), e)
    })?;
    let key = russh_keys::decode_secret_key(&data, None).map_err(|e| {
        SourceGateError::tunnel_failed(format!("failed to parse SSH key {}", path.display()), e)
    })?;
    Ok(Arc::new(key))
}

struct SshChannelOpener {
    handle: Mutex<client::Handle<ClientHandler>>,
}

#[async_trait]
impl ChannelOpener for SshChannelOpener {
    async fn open(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    SourceGateError::tunnel_failed(
                        format!("failed to open SSH channel to {host}:{port}"),
                        e,
                    )
                })?
        };
        Ok(Box::new(channel.into_stream()))
    }

    async fn shutdown(&self) {
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }
}
