//! SSH tunnels for reaching private databases.
//!
//! A tunnel binds a local TCP port and forwards every accepted connection
//! through an SSH session to `remote_host:remote_port`. Tunnels are never
//! shared: each acquisition gets its own session and its own ephemeral port.
//!
//! SSH settings travel in the database URL's query string and are stripped
//! before the URL reaches a driver:
//!
//! | parameter         | meaning                               |
//! |-------------------|---------------------------------------|
//! | `ssh_host`        | bastion host (enables tunnelling)     |
//! | `ssh_port`        | bastion port, default 22              |
//! | `ssh_user`        | required                              |
//! | `ssh_password`    | password auth (exclusive with key)    |
//! | `ssh_key_path`    | private key auth, `~` expanded        |
//! | `ssh_remote_host` | override of the URL host              |
//! | `ssh_remote_port` | override of the URL port              |
//! | `ssh_local_port`  | fixed local port instead of port 0    |

mod forwarder;
pub mod ssh;

pub use forwarder::{
    ChannelOpener, SshTunnel, TunnelConnector, TunnelIo, TunnelStream, acquire_tunnel,
    with_tunnel,
};
pub use ssh::SshConnector;

use crate::{Result, error::SourceGateError};
use std::path::PathBuf;
use url::Url;
use zeroize::Zeroizing;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

const SSH_PARAM_PREFIX: &str = "ssh_";

/// How the tunnel authenticates against the SSH host.
#[derive(Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(Zeroizing<String>),
    /// Private key file
    KeyPath(PathBuf),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::KeyPath(path) => f.debug_tuple("KeyPath").field(path).finish(),
        }
    }
}

impl PartialEq for SshAuth {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Password(a), Self::Password(b)) => a.as_str() == b.as_str(),
            (Self::KeyPath(a), Self::KeyPath(b)) => a == b,
            _ => false,
        }
    }
}

/// Everything needed to open one tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct SshTunnelConfig {
    /// SSH host
    pub ssh_host: String,
    /// SSH port
    pub ssh_port: u16,
    /// SSH user
    pub ssh_user: String,
    /// Exactly one authentication method
    pub auth: SshAuth,
    /// Host the SSH server connects to
    pub remote_host: String,
    /// Port the SSH server connects to
    pub remote_port: u16,
    /// Fixed local port; `None` lets the OS pick one
    pub local_port: Option<u16>,
}

impl SshTunnelConfig {
    /// `user@host:port` of the SSH endpoint.
    pub fn ssh_target(&self) -> String {
        format!("{}@{}:{}", self.ssh_user, self.ssh_host, self.ssh_port)
    }

    /// `host:port` of the forwarded destination.
    pub fn remote_target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

/// Lifecycle of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Created, nothing bound yet
    Idle,
    /// Local port bound, SSH handshake in progress
    Establishing,
    /// Forwarding connections
    Active,
    /// Shutdown in progress
    Closing,
    /// Shut down, port released
    Closed,
    /// Establishment failed, port released
    Failed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Establishing => "establishing",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// True when the URL's query string carries any `ssh_*` parameter.
pub fn has_ssh_params(url: &str) -> bool {
    Url::parse(url).is_ok_and(|parsed| {
        parsed
            .query_pairs()
            .any(|(key, _)| key.to_ascii_lowercase().starts_with(SSH_PARAM_PREFIX))
    })
}

/// Splits SSH parameters out of a database URL.
///
/// Returns the URL without any `ssh_*` parameter and, when `ssh_host` is
/// present, the tunnel configuration. `default_port` is used for the remote
/// port when neither the URL nor `ssh_remote_port` gives one.
///
/// # Errors
/// Returns a configuration error for malformed ports, a missing user, or
/// anything other than exactly one of `ssh_password`/`ssh_key_path`
pub fn extract_ssh_params(
    url: &str,
    default_port: Option<u16>,
) -> Result<(Zeroizing<String>, Option<SshTunnelConfig>)> {
    let mut parsed = Url::parse(url).map_err(|e| {
        SourceGateError::unsupported_url(crate::security::sanitize_url(url), format!("invalid URL: {e}"))
    })?;

    let (ssh, kept): (Vec<(String, String)>, Vec<(String, String)>) = parsed
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .partition(|(key, _)| key.to_ascii_lowercase().starts_with(SSH_PARAM_PREFIX));

    if ssh.is_empty() {
        return Ok((Zeroizing::new(url.to_string()), None));
    }

    let param = |name: &str| {
        ssh.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    };

    let ssh_host = param("ssh_host")
        .ok_or_else(|| SourceGateError::configuration("ssh_host is required when SSH parameters are given"))?
        .to_string();
    let ssh_user = param("ssh_user")
        .ok_or_else(|| SourceGateError::configuration("ssh_user is required"))?
        .to_string();
    let ssh_port = parse_port(param("ssh_port"), "ssh_port")?.unwrap_or(DEFAULT_SSH_PORT);
    let local_port = parse_port(param("ssh_local_port"), "ssh_local_port")?;

    let auth = match (param("ssh_password"), param("ssh_key_path")) {
        (Some(password), None) => SshAuth::Password(Zeroizing::new(password.to_string())),
        (None, Some(path)) => SshAuth::KeyPath(expand_home(path)),
        (None, None) => {
            return Err(SourceGateError::configuration(
                "Either ssh_password or ssh_key_path is required",
            ));
        }
        (Some(_), Some(_)) => {
            return Err(SourceGateError::configuration(
                "Only one of ssh_password or ssh_key_path may be set",
            ));
        }
    };

    let remote_host = match param("ssh_remote_host") {
        Some(host) => host.to_string(),
        None => parsed
            .host_str()
            .filter(|host| !host.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                SourceGateError::configuration("database URL has no host to tunnel to")
            })?,
    };
    let remote_port = parse_port(param("ssh_remote_port"), "ssh_remote_port")?
        .or_else(|| parsed.port())
        .or(default_port)
        .ok_or_else(|| {
            SourceGateError::configuration("database URL has no port and the driver has no default")
        })?;

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    let config = SshTunnelConfig {
        ssh_host,
        ssh_port,
        ssh_user,
        auth,
        remote_host,
        remote_port,
        local_port,
    };

    Ok((Zeroizing::new(parsed.to_string()), Some(config)))
}

/// Points `url` at the local end of a tunnel.
///
/// # Errors
/// Returns a configuration error if the URL cannot carry a host and port
pub fn rewrite_to_local(url: &str, local_port: u16) -> Result<Zeroizing<String>> {
    let mut parsed = Url::parse(url).map_err(|e| {
        SourceGateError::configuration(format!("cannot rewrite URL for tunnel: {e}"))
    })?;
    parsed
        .set_host(Some("127.0.0.1"))
        .map_err(|e| SourceGateError::configuration(format!("cannot set tunnel host: {e}")))?;
    parsed
        .set_port(Some(local_port))
        .map_err(|()| SourceGateError::configuration("URL cannot carry a port"))?;
    Ok(Zeroizing::new(parsed.to_string()))
}

fn parse_port(value: Option<&str>, name: &str) -> Result<Option<u16>> {
    value
        .map(|raw| {
            raw.parse::<u16>()
                .ok()
                .filter(|port| *port > 0)
                .ok_or_else(|| {
                    SourceGateError::configuration(format!("{name} must be a port number, got '{raw}'"))
                })
        })
        .transpose()
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_key_based_tunnel() {
        let (clean, config) = extract_ssh_params(
            "postgresql://u:p@host:5432/db?ssh_host=bastion&ssh_user=ubuntu&ssh_key_path=/k.pem",
            Some(5432),
        )
        .unwrap();

        assert_eq!(clean.as_str(), "postgresql://u:p@host:5432/db");
        let config = config.unwrap();
        assert_eq!(config.ssh_host, "bastion");
        assert_eq!(config.ssh_port, 22);
        assert_eq!(config.ssh_user, "ubuntu");
        assert_eq!(config.auth, SshAuth::KeyPath(PathBuf::from("/k.pem")));
        assert_eq!(config.remote_host, "host");
        assert_eq!(config.remote_port, 5432);
        assert_eq!(config.local_port, None);
    }

    #[test]
    fn test_non_ssh_params_are_kept() {
        let (clean, config) = extract_ssh_params(
            "mysql://u@db.internal/app?sslmode=require&ssh_host=b&ssh_port=2222&ssh_user=ops&ssh_password=pw&timeout=5",
            Some(3306),
        )
        .unwrap();

        assert_eq!(clean.as_str(), "mysql://u@db.internal/app?sslmode=require&timeout=5");
        let config = config.unwrap();
        assert_eq!(config.ssh_port, 2222);
        assert_eq!(config.remote_port, 3306);
        assert!(matches!(config.auth, SshAuth::Password(_)));
        assert!(format!("{config:?}").contains("Password(***)"));
    }

    #[test]
    fn test_has_ssh_params() {
        assert!(has_ssh_params("postgresql://h/db?SSH_HOST=b"));
        assert!(!has_ssh_params("postgresql://h/db?sslmode=require"));
        assert!(!has_ssh_params("not a url"));
    }

    #[test]
    fn test_url_without_ssh_params_is_unchanged() {
        let url = "postgresql://u:p@host/db?sslmode=disable";
        let (clean, config) = extract_ssh_params(url, Some(5432)).unwrap();
        assert_eq!(clean.as_str(), url);
        assert!(config.is_none());
    }

    #[test]
    fn test_remote_overrides() {
        let (_, config) = extract_ssh_params(
            "postgresql://u@public-name/db?ssh_host=b&ssh_user=u&ssh_password=x&ssh_remote_host=10.0.0.5&ssh_remote_port=6432&ssh_local_port=15432",
            Some(5432),
        )
        .unwrap();
        let config = config.unwrap();
        assert_eq!(config.remote_target(), "10.0.0.5:6432");
        assert_eq!(config.local_port, Some(15432));
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("postgresql://h/db?ssh_host=b&ssh_password=x", "ssh_user is required"),
            ("postgresql://h/db?ssh_host=b&ssh_user=u", "Either ssh_password or ssh_key_path"),
            (
                "postgresql://h/db?ssh_host=b&ssh_user=u&ssh_password=x&ssh_key_path=/k",
                "Only one of",
            ),
            ("postgresql://h/db?ssh_user=u&ssh_password=x", "ssh_host is required"),
            (
                "postgresql://h/db?ssh_host=b&ssh_user=u&ssh_password=x&ssh_port=99999",
                "ssh_port must be a port number",
            ),
        ];

        for (url, expected) in cases {
            let err = extract_ssh_params(url, Some(5432)).unwrap_err();
            assert!(err.to_string().contains(expected), "{url}: {err}");
        }
    }

    #[test]
    fn test_missing_port_without_default_is_error() {
        let err = extract_ssh_params(
            "customdb://h/db?ssh_host=b&ssh_user=u&ssh_password=x",
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no port"));
    }

    #[test]
    fn test_home_expansion() {
        temp_env::with_var("HOME", Some("/home/ops"), || {
            assert_eq!(expand_home("~/.ssh/id_ed25519"), PathBuf::from("/home/ops/.ssh/id_ed25519"));
            assert_eq!(expand_home("/abs/key"), PathBuf::from("/abs/key"));
        });
    }

    #[test]
    fn test_rewrite_to_local() {
        let rewritten = rewrite_to_local("postgresql://u:p@db.internal:5432/app?sslmode=require", 40123).unwrap();
        assert_eq!(
            rewritten.as_str(),
            "postgresql://u:p@127.0.0.1:40123/app?sslmode=require"
        );
    }
}
