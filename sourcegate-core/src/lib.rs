//! Core of SourceGate: one read-only access layer over SQL databases,
//! OpenAPI-described HTTP services and directories of documents.
//!
//! A caller opens a [`Session`], asks it for a datasource by URL and runs
//! the operations of that datasource's kind. The URL alone decides the kind
//! (see [`classify`]); databases are reached through the static engine table
//! in [`adapters`], optionally through an SSH tunnel (see [`tunnel`]).
//!
//! # Security Guarantees
//! - Every SQL statement passes the read-only gate in [`safety`] before it
//!   reaches a backend
//! - Credentials are stripped from every URL that is logged, cached or
//!   returned in an error
//! - Passwords and SSH secrets live in `Zeroizing` buffers
//!
//! # Architecture
//! - Factory pattern over a static engine table for database drivers
//! - A session-scoped registry with single-flight creation
//! - One trait per datasource kind, reached through a tagged enum
//! - Cancellation tokens scoped to the session for every background task

pub mod adapters;
pub mod classify;
pub mod config;
pub mod datasources;
pub mod error;
pub mod logging;
pub mod models;
pub mod pagination;
pub mod safety;
pub mod search;
pub mod security;
pub mod session;
pub mod tunnel;

// Re-export commonly used types
pub use adapters::{ENGINES, EngineSpec, QueryExecutor, TablePath};
pub use classify::classify;
pub use config::{ConnectionConfig, SessionConfig};
pub use datasources::{
    ApiRequest, ApiSource, DatabaseSource, Datasource, DatasourceContext, LibrarySource,
};
pub use error::{Result, SourceGateError};
pub use models::{ApiResponse, DatasourceKind, Page, QueryResult};
pub use search::{SearchMode, SearchRequest};
pub use security::{ConnectionUrl, SecretSource, sanitize_url};
pub use session::Session;
