//! Credential handling: URL sanitization and password placeholders.
//!
//! # Security
//! - The sanitized URL is the only form that is logged, cached or returned
//! - Raw URLs live in `Zeroizing` buffers and are cleared on drop
//! - Placeholder passwords are percent-encoded before substitution

pub mod connection_url;
pub mod secrets;

pub use connection_url::{ConnectionUrl, MASK, sanitize_url};
pub use secrets::{
    EnvSecretSource, NoSecrets, PASSWORD_PLACEHOLDER, SecretSource, StaticSecret,
    substitute_password,
};
