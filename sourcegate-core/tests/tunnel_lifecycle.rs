//! SSH tunnel lifecycle tests.
//!
//! The SSH session is replaced by a connector that opens plain TCP
//! connections, so the listener, forwarding loop and teardown run for real
//! against a local echo server without an SSH daemon.

use async_trait::async_trait;
use sourcegate_core::{
    Result, Session, SessionConfig, SourceGateError,
    tunnel::{
        ChannelOpener, SshAuth, SshTunnel, SshTunnelConfig, TunnelConnector, TunnelState,
        TunnelStream, acquire_tunnel, with_tunnel,
    },
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const HANDSHAKE: Duration = Duration::from_secs(5);

/// Opens the remote end directly over TCP.
struct DirectOpener {
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelOpener for DirectOpener {
    async fn open(&self, host: &str, port: u16) -> Result<TunnelStream> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| SourceGateError::tunnel_failed("direct connect", e))?;
        Ok(Box::new(stream))
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct DirectConnector {
    shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl TunnelConnector for DirectConnector {
    async fn connect(&self, _config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>> {
        Ok(Arc::new(DirectOpener {
            shutdowns: Arc::clone(&self.shutdowns),
        }))
    }
}

struct RefusingConnector;

#[async_trait]
impl TunnelConnector for RefusingConnector {
    async fn connect(&self, config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>> {
        Err(SourceGateError::tunnel(format!(
            "authentication rejected by {}",
            config.ssh_target()
        )))
    }
}

struct HangingConnector;

#[async_trait]
impl TunnelConnector for HangingConnector {
    async fn connect(&self, _config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>> {
        std::future::pending().await
    }
}

/// Counts handshakes, takes a while over each, then refuses.
#[derive(Default)]
struct SlowRefusingConnector {
    handshakes: AtomicUsize,
}

#[async_trait]
impl TunnelConnector for SlowRefusingConnector {
    async fn connect(&self, config: &SshTunnelConfig) -> Result<Arc<dyn ChannelOpener>> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;
        Err(SourceGateError::tunnel(format!(
            "host key rejected by {}",
            config.ssh_target()
        )))
    }
}

/// Starts a TCP echo server and returns its port.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

fn config(remote_port: u16) -> SshTunnelConfig {
    SshTunnelConfig {
        ssh_host: "bastion.internal".to_string(),
        ssh_port: 22,
        ssh_user: "ops".to_string(),
        auth: SshAuth::Password("secret".to_string().into()),
        remote_host: "127.0.0.1".to_string(),
        remote_port,
        local_port: None,
    }
}

async fn round_trip(port: u16, message: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(message).await.unwrap();
    let mut echoed = vec![0; message.len()];
    client.read_exact(&mut echoed).await.unwrap();
    echoed
}

async fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).await.is_ok()
}

#[tokio::test]
async fn test_tunnel_forwards_then_releases_port() {
    let remote = echo_server().await;
    let connector = DirectConnector::default();
    let cancel = CancellationToken::new();

    let mut tunnel = acquire_tunnel(config(remote), &connector, HANDSHAKE, &cancel)
        .await
        .unwrap();
    assert_eq!(tunnel.state(), TunnelState::Active);
    let port = tunnel.local_port().unwrap();
    assert_ne!(port, remote);

    assert_eq!(round_trip(port, b"ping").await, b"ping");
    assert_eq!(round_trip(port, b"second connection").await, b"second connection");

    tunnel.close().await;
    assert_eq!(tunnel.state(), TunnelState::Closed);
    assert_eq!(tunnel.local_port(), None);
    assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
    assert!(port_is_free(port).await);

    // Closing twice is a no-op
    tunnel.close().await;
    assert_eq!(tunnel.state(), TunnelState::Closed);
}

#[tokio::test]
async fn test_tunnels_are_not_shared() {
    let remote = echo_server().await;
    let connector = DirectConnector::default();
    let cancel = CancellationToken::new();

    let mut first = acquire_tunnel(config(remote), &connector, HANDSHAKE, &cancel)
        .await
        .unwrap();
    let mut second = acquire_tunnel(config(remote), &connector, HANDSHAKE, &cancel)
        .await
        .unwrap();
    assert_ne!(first.local_port(), second.local_port());

    first.close().await;
    let port = second.local_port().unwrap();
    assert_eq!(round_trip(port, b"still up").await, b"still up");
    second.close().await;
}

#[tokio::test]
async fn test_with_tunnel_closes_on_body_error() {
    let remote = echo_server().await;
    let connector = DirectConnector::default();
    let cancel = CancellationToken::new();
    let mut seen = None;

    let outcome: Result<()> = with_tunnel(config(remote), &connector, HANDSHAKE, &cancel, |port| {
        seen = Some(port);
        async move {
            assert_eq!(round_trip(port, b"inside").await, b"inside");
            Err(SourceGateError::query("body failed"))
        }
    })
    .await;

    assert!(matches!(outcome, Err(SourceGateError::Query { .. })));
    assert!(port_is_free(seen.unwrap()).await);
    assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_with_tunnel_returns_body_value() {
    let remote = echo_server().await;
    let connector = DirectConnector::default();
    let cancel = CancellationToken::new();

    let echoed = with_tunnel(config(remote), &connector, HANDSHAKE, &cancel, |port| async move {
        Ok(round_trip(port, b"value").await)
    })
    .await
    .unwrap();
    assert_eq!(echoed, b"value");
}

#[tokio::test]
async fn test_cancellation_closes_tunnel() {
    let remote = echo_server().await;
    let connector = DirectConnector::default();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome: Result<()> = with_tunnel(config(remote), &connector, HANDSHAKE, &cancel, |_| {
        std::future::pending()
    })
    .await;
    assert!(matches!(outcome, Err(SourceGateError::Cancelled { .. })));
    assert_eq!(connector.shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_handshake_fails_and_releases_port() {
    let cancel = CancellationToken::new();
    let mut tunnel = SshTunnel::new(config(5432));

    let err = tunnel
        .establish(&RefusingConnector, HANDSHAKE, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceGateError::Tunnel { .. }));
    assert_eq!(tunnel.state(), TunnelState::Failed);
    assert_eq!(tunnel.local_port(), None);

    // Failed is terminal
    assert!(tunnel.establish(&DirectConnector::default(), HANDSHAKE, &cancel).await.is_err());
    tunnel.close().await;
    assert_eq!(tunnel.state(), TunnelState::Failed);
}

#[tokio::test]
async fn test_handshake_timeout() {
    let cancel = CancellationToken::new();
    let err = acquire_tunnel(config(5432), &HangingConnector, Duration::from_millis(50), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceGateError::Tunnel { .. }));
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_cancelled_before_handshake() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = acquire_tunnel(config(5432), &HangingConnector, HANDSHAKE, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SourceGateError::Cancelled { .. }));
}

#[tokio::test]
async fn test_error_messages_hide_ssh_password() {
    let err = acquire_tunnel(config(5432), &RefusingConnector, HANDSHAKE, &CancellationToken::new())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("ops@bastion.internal:22"));
    assert!(!message.contains("secret"));
    assert!(!format!("{:?}", config(5432)).contains("secret"));
}

#[tokio::test]
async fn test_tunnel_concurrent_session_requests_share_one_handshake() {
    let connector = Arc::new(SlowRefusingConnector::default());
    let session = Session::new(SessionConfig::default())
        .unwrap()
        .with_connector(Arc::clone(&connector) as Arc<dyn TunnelConnector>);
    let url = "postgresql://reader:pw@10.0.0.5:5432/app?ssh_host=bastion&ssh_user=ops&ssh_password=hunter2";

    let outcomes = futures::future::join_all((0..8).map(|_| session.get_or_create(url))).await;
    assert_eq!(connector.handshakes.load(Ordering::SeqCst), 1);

    let messages: Vec<String> = outcomes
        .into_iter()
        .map(|outcome| {
            let err = outcome.unwrap_err();
            assert!(matches!(err, SourceGateError::Tunnel { .. }), "{err}");
            err.to_string()
        })
        .collect();
    assert!(messages.iter().all(|message| message == &messages[0]));
    assert!(messages[0].contains("host key rejected"));
    assert!(!messages[0].contains("hunter2"));

    // Failures are not cached
    assert!(session.urls().is_empty());
    assert!(session.get_or_create(url).await.is_err());
    assert_eq!(connector.handshakes.load(Ordering::SeqCst), 2);
    session.close().await;
}
