//! Out-of-band secrets for `{password}` placeholders.

use crate::{Result, error::SourceGateError};
use zeroize::Zeroizing;

/// Placeholder substituted with the database password.
pub const PASSWORD_PLACEHOLDER: &str = "{password}";

/// Provides secrets that must not be written into connection URLs.
pub trait SecretSource: Send + Sync {
    /// Returns the database password, if one is configured.
    fn database_password(&self) -> Option<Zeroizing<String>>;
}

/// Reads the password from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvSecretSource {
    var: String,
}

impl EnvSecretSource {
    /// Variable read by [`EnvSecretSource::default`].
    pub const DEFAULT_VAR: &'static str = "DATABASE_PASSWORD";

    /// Reads from a custom variable.
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvSecretSource {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl SecretSource for EnvSecretSource {
    fn database_password(&self) -> Option<Zeroizing<String>> {
        std::env::var(&self.var)
            .ok()
            .filter(|value| !value.is_empty())
            .map(Zeroizing::new)
    }
}

/// A password supplied up front, e.g. from an interactive prompt.
#[derive(Clone)]
pub struct StaticSecret(Zeroizing<String>);

impl StaticSecret {
    /// Wraps a password.
    pub fn new(password: impl Into<String>) -> Self {
        Self(Zeroizing::new(password.into()))
    }
}

impl std::fmt::Debug for StaticSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticSecret(***)")
    }
}

impl SecretSource for StaticSecret {
    fn database_password(&self) -> Option<Zeroizing<String>> {
        Some(self.0.clone())
    }
}

/// Secret source that never yields a password.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecrets;

impl SecretSource for NoSecrets {
    fn database_password(&self) -> Option<Zeroizing<String>> {
        None
    }
}

/// Percent-encodes every byte outside the unreserved set.
fn encode_component(value: &str) -> String {
    // byte_serialize writes spaces as '+' and escapes literal '+' as %2B,
    // so every remaining '+' stands for a space.
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Replaces `{password}` in `url` with the percent-encoded secret.
///
/// URLs without the placeholder are returned unchanged.
///
/// # Errors
/// Returns a configuration error when the placeholder is present but the
/// secret source has no password
pub fn substitute_password(url: &str, secrets: &dyn SecretSource) -> Result<Zeroizing<String>> {
    if !url.contains(PASSWORD_PLACEHOLDER) {
        return Ok(Zeroizing::new(url.to_string()));
    }

    let password = secrets.database_password().ok_or_else(|| {
        SourceGateError::configuration(format!(
            "URL contains a {PASSWORD_PLACEHOLDER} placeholder but no password is available \
             (set {})",
            EnvSecretSource::DEFAULT_VAR
        ))
    })?;

    let encoded = Zeroizing::new(encode_component(&password));
    tracing::debug!("Substituted database password placeholder");
    Ok(Zeroizing::new(url.replace(PASSWORD_PLACEHOLDER, &encoded)))
}
