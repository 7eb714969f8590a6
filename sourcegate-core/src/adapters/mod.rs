//! Driver factory and database backends.
//!
//! Every supported driver is listed in the static [`ENGINES`] table, which
//! maps driver names to an async and/or sync constructor. The factory tries
//! the async constructor first and falls back to the sync one only when the
//! async path reports [`SourceGateError::AsyncUnavailable`].
//!
//! # Module Structure
//! - `executor`: the [`QueryExecutor`] seam and the blocking adapter
//! - `dialect`: identifier quoting and per-backend metadata SQL
//! - `strategy`: ordered fallback chains
//! - Backend modules (postgres, mysql, sqlite, mssql, duckdb, warehouse)

pub mod dialect;
pub mod executor;
pub mod strategy;
mod values;
pub mod warehouse;

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "mssql")]
mod mssql;
#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgresql")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;
#[cfg(feature = "sqlite-blocking")]
mod sqlite_blocking;

pub use dialect::TablePath;
pub use executor::{BlockingConnection, BlockingExecutor, QueryExecutor};
pub use strategy::{Strategy, first_success};

use crate::config::ConnectionConfig;
use crate::security::{SecretSource, substitute_password};
use crate::tunnel::{self, SshTunnel, TunnelConnector};
use crate::{Result, error::SourceGateError};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

/// Backend family behind a driver name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// PostgreSQL
    Postgres,
    /// MySQL and MariaDB
    MySql,
    /// SQLite
    Sqlite,
    /// Microsoft SQL Server
    SqlServer,
    /// DuckDB
    DuckDb,
    /// Google BigQuery
    BigQuery,
    /// Snowflake
    Snowflake,
    /// Databricks SQL
    Databricks,
}

impl Backend {
    /// Every backend family.
    pub const ALL: [Self; 8] = [
        Self::Postgres,
        Self::MySql,
        Self::Sqlite,
        Self::SqlServer,
        Self::DuckDb,
        Self::BigQuery,
        Self::Snowflake,
        Self::Databricks,
    ];
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Postgres => "PostgreSQL",
            Self::MySql => "MySQL",
            Self::Sqlite => "SQLite",
            Self::SqlServer => "SQL Server",
            Self::DuckDb => "DuckDB",
            Self::BigQuery => "BigQuery",
            Self::Snowflake => "Snowflake",
            Self::Databricks => "Databricks",
        };
        f.write_str(name)
    }
}

/// Constructor stored in the engine table.
pub type Constructor =
    for<'a> fn(&'a str, &'a ConnectionConfig) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>>;

/// One row of the engine table.
#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    /// Canonical driver name, also the URL scheme handed to the backend
    pub driver: &'static str,
    /// Every driver name that selects this row
    pub names: &'static [&'static str],
    /// Backend family
    pub backend: Backend,
    /// Async engine string, if the driver has one
    pub async_engine: Option<&'static str>,
    /// Sync engine string, if the driver has one
    pub sync_engine: Option<&'static str>,
    /// Whether the driver speaks plain TCP and can be tunnelled
    pub tunnelable: bool,
    /// Port used when the URL has none
    pub default_port: Option<u16>,
    #[serde(skip)]
    async_connect: Option<Constructor>,
    #[serde(skip)]
    sync_connect: Option<Constructor>,
}

impl std::fmt::Debug for EngineSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSpec")
            .field("driver", &self.driver)
            .field("async_engine", &self.async_engine)
            .field("sync_engine", &self.sync_engine)
            .field("tunnelable", &self.tunnelable)
            .finish_non_exhaustive()
    }
}

/// Generates a constructor for a driver whose Cargo feature is disabled.
macro_rules! compiled_out {
    ($name:ident, $driver:literal, $feature:literal) => {
        #[allow(clippy::unnecessary_wraps)]
        fn $name<'a>(
            _url: &'a str,
            _config: &'a ConnectionConfig,
        ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
            Box::pin(async {
                Err(SourceGateError::unsupported_backend(
                    $driver,
                    concat!("driver not compiled in; rebuild with --features ", $feature),
                ))
            })
        }
    };
    (async $name:ident, $driver:literal, $feature:literal) => {
        fn $name<'a>(
            _url: &'a str,
            _config: &'a ConnectionConfig,
        ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
            Box::pin(async {
                Err(SourceGateError::async_unavailable(
                    $driver,
                    concat!("async engine needs --features ", $feature),
                ))
            })
        }
    };
}

#[cfg(feature = "postgresql")]
use postgres::connect as connect_postgres;
#[cfg(not(feature = "postgresql"))]
compiled_out!(connect_postgres, "postgresql", "postgresql");

#[cfg(feature = "mysql")]
use mysql::connect as connect_mysql;
#[cfg(not(feature = "mysql"))]
compiled_out!(connect_mysql, "mysql", "mysql");

#[cfg(feature = "sqlite")]
use sqlite::connect as connect_sqlite;
#[cfg(not(feature = "sqlite"))]
compiled_out!(async connect_sqlite, "sqlite", "sqlite");

#[cfg(feature = "sqlite-blocking")]
use sqlite_blocking::connect as connect_sqlite_blocking;
#[cfg(not(feature = "sqlite-blocking"))]
compiled_out!(connect_sqlite_blocking, "sqlite", "sqlite or sqlite-blocking");

#[cfg(feature = "mssql")]
use mssql::connect as connect_mssql;
#[cfg(not(feature = "mssql"))]
compiled_out!(connect_mssql, "mssql", "mssql");

#[cfg(feature = "duckdb")]
use self::duckdb::connect as connect_duckdb;
#[cfg(not(feature = "duckdb"))]
compiled_out!(connect_duckdb, "duckdb", "duckdb");

/// The static engine table.
pub static ENGINES: &[EngineSpec] = &[
    EngineSpec {
        driver: "postgresql",
        names: &["postgresql", "postgres"],
        backend: Backend::Postgres,
        async_engine: Some("postgresql+sqlx"),
        sync_engine: None,
        tunnelable: true,
        default_port: Some(5432),
        async_connect: Some(connect_postgres),
        sync_connect: None,
    },
    EngineSpec {
        driver: "mysql",
        names: &["mysql", "mariadb"],
        backend: Backend::MySql,
        async_engine: Some("mysql+sqlx"),
        sync_engine: None,
        tunnelable: true,
        default_port: Some(3306),
        async_connect: Some(connect_mysql),
        sync_connect: None,
    },
    EngineSpec {
        driver: "sqlite",
        names: &["sqlite"],
        backend: Backend::Sqlite,
        async_engine: Some("sqlite+sqlx"),
        sync_engine: Some("sqlite+rusqlite"),
        tunnelable: false,
        default_port: None,
        async_connect: Some(connect_sqlite),
        sync_connect: Some(connect_sqlite_blocking),
    },
    EngineSpec {
        driver: "mssql",
        names: &["mssql", "sqlserver"],
        backend: Backend::SqlServer,
        async_engine: None,
        sync_engine: Some("mssql+tiberius"),
        tunnelable: true,
        default_port: Some(1433),
        async_connect: None,
        sync_connect: Some(connect_mssql),
    },
    EngineSpec {
        driver: "duckdb",
        names: &["duckdb"],
        backend: Backend::DuckDb,
        async_engine: None,
        sync_engine: Some("duckdb"),
        tunnelable: false,
        default_port: None,
        async_connect: None,
        sync_connect: Some(connect_duckdb),
    },
    EngineSpec {
        driver: "bigquery",
        names: &["bigquery"],
        backend: Backend::BigQuery,
        async_engine: Some("bigquery+rest"),
        sync_engine: None,
        tunnelable: false,
        default_port: None,
        async_connect: Some(warehouse::bigquery::connect),
        sync_connect: None,
    },
    EngineSpec {
        driver: "snowflake",
        names: &["snowflake"],
        backend: Backend::Snowflake,
        async_engine: Some("snowflake+rest"),
        sync_engine: None,
        tunnelable: false,
        default_port: None,
        async_connect: Some(warehouse::snowflake::connect),
        sync_connect: None,
    },
    EngineSpec {
        driver: "databricks",
        names: &["databricks"],
        backend: Backend::Databricks,
        async_engine: Some("databricks+rest"),
        sync_engine: None,
        tunnelable: false,
        default_port: None,
        async_connect: Some(warehouse::databricks::connect),
        sync_connect: None,
    },
];

/// Extracts the normalized driver name from a URL's scheme.
///
/// `PostgreSQL+asyncpg://...` yields `postgresql`.
///
/// # Errors
/// Returns `UnsupportedUrl` when the URL has no scheme
pub fn driver_name(url: &str) -> Result<String> {
    let scheme = url
        .split_once(':')
        .map(|(scheme, _)| scheme)
        .filter(|scheme| !scheme.is_empty())
        .ok_or_else(|| {
            SourceGateError::unsupported_url(crate::security::sanitize_url(url), "missing scheme")
        })?;
    let driver = scheme.split('+').next().unwrap_or(scheme);
    Ok(driver.to_ascii_lowercase())
}

/// Finds the engine table row for a driver name.
///
/// # Errors
/// Returns `UnsupportedBackend` for unknown drivers
pub fn lookup_engine(driver: &str) -> Result<&'static EngineSpec> {
    let driver = driver.to_ascii_lowercase();
    ENGINES
        .iter()
        .find(|spec| spec.names.contains(&driver.as_str()))
        .ok_or_else(|| {
            let known: Vec<&str> = ENGINES.iter().flat_map(|spec| spec.names.iter().copied()).collect();
            SourceGateError::unsupported_backend(
                driver.clone(),
                format!("unknown driver; supported: {}", known.join(", ")),
            )
        })
}

/// Dependencies the factory needs beyond the URL.
pub struct FactoryContext<'a> {
    /// Timeouts and pool limits
    pub config: &'a ConnectionConfig,
    /// Source of the `{password}` placeholder value
    pub secrets: &'a dyn SecretSource,
    /// Opens SSH sessions when the URL asks for a tunnel
    pub connector: &'a dyn TunnelConnector,
    /// Aborts tunnel establishment
    pub cancel: &'a CancellationToken,
}

/// A live database backend plus the tunnel it runs through, if any.
pub struct DatabaseHandle {
    spec: &'static EngineSpec,
    engine: &'static str,
    executor: Box<dyn QueryExecutor>,
    tunnel: tokio::sync::Mutex<Option<SshTunnel>>,
    tunnel_port: Option<u16>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("driver", &self.spec.driver)
            .field("engine", &self.engine)
            .field("tunnel_port", &self.tunnel_port)
            .finish_non_exhaustive()
    }
}

impl DatabaseHandle {
    /// Wraps an executor that runs without a tunnel.
    pub fn new(spec: &'static EngineSpec, executor: Box<dyn QueryExecutor>) -> Self {
        Self {
            spec,
            engine: executor.engine(),
            executor,
            tunnel: tokio::sync::Mutex::new(None),
            tunnel_port: None,
        }
    }

    fn with_tunnel(mut self, tunnel: SshTunnel) -> Self {
        self.tunnel_port = tunnel.local_port();
        self.tunnel = tokio::sync::Mutex::new(Some(tunnel));
        self
    }

    /// Engine table row.
    pub const fn spec(&self) -> &'static EngineSpec {
        self.spec
    }

    /// Engine string actually selected (async or sync).
    pub const fn engine(&self) -> &'static str {
        self.engine
    }

    /// Local tunnel port, when connected through SSH.
    pub const fn tunnel_port(&self) -> Option<u16> {
        self.tunnel_port
    }

    /// The executor queries run on.
    pub fn executor(&self) -> &dyn QueryExecutor {
        self.executor.as_ref()
    }

    /// Closes the backend, then the tunnel.
    pub async fn close(&self) {
        self.executor.close().await;
        if let Some(mut tunnel) = self.tunnel.lock().await.take() {
            tunnel.close().await;
        }
    }
}

/// Creates a database connection from a URL.
///
/// Steps: resolve the driver, substitute `{password}`, strip SSH parameters
/// and open a tunnel when present, then connect the engine. A tunnel opened
/// here is closed again if the engine fails to connect.
///
/// # Errors
/// Returns `UnsupportedBackend` for unknown drivers or tunnels on
/// non-tunnelable drivers, `Configuration` for bad placeholders or SSH
/// parameters, `Tunnel` for SSH failures, and the engine's connect error
pub async fn create_database_connection(
    url: &str,
    context: &FactoryContext<'_>,
) -> Result<DatabaseHandle> {
    let spec = lookup_engine(&driver_name(url)?)?;
    if !spec.tunnelable && tunnel::has_ssh_params(url) {
        return Err(SourceGateError::unsupported_backend(
            spec.driver,
            "SSH tunnels need a backend reachable at a plain host:port",
        ));
    }

    let url = substitute_password(url, context.secrets)?;
    let (url, tunnel_config) = tunnel::extract_ssh_params(&url, spec.default_port)?;

    let Some(tunnel_config) = tunnel_config else {
        let executor = connect_engine(spec, &url, context.config).await?;
        return Ok(DatabaseHandle::new(spec, executor));
    };

    let mut tunnel = tunnel::acquire_tunnel(
        tunnel_config,
        context.connector,
        context.config.ssh_timeout,
        context.cancel,
    )
    .await?;

    let connected = match tunnel.local_port() {
        Some(port) => match tunnel::rewrite_to_local(&url, port) {
            Ok(local_url) => connect_engine(spec, &local_url, context.config).await,
            Err(e) => Err(e),
        },
        None => Err(SourceGateError::tunnel("active tunnel has no local port")),
    };

    match connected {
        Ok(executor) => Ok(DatabaseHandle::new(spec, executor).with_tunnel(tunnel)),
        Err(e) => {
            tunnel.close().await;
            Err(e)
        }
    }
}

/// Connects one engine table row: async first, sync on `AsyncUnavailable`.
///
/// # Errors
/// Returns the constructor's error, or `UnsupportedBackend` when no engine
/// variant is available
pub async fn connect_engine(
    spec: &'static EngineSpec,
    url: &str,
    config: &ConnectionConfig,
) -> Result<Box<dyn QueryExecutor>> {
    let url = canonical_scheme(url, spec.driver);

    if let Some(connect) = spec.async_connect {
        match connect(&url, config).await {
            Err(SourceGateError::AsyncUnavailable { driver, reason }) => {
                tracing::debug!(driver = %driver, "Async engine unavailable ({}), trying sync engine", reason);
            }
            other => return other,
        }
    }

    match spec.sync_connect {
        Some(connect) => connect(&url, config).await,
        None => Err(SourceGateError::unsupported_backend(
            spec.driver,
            "no engine available in this build",
        )),
    }
}

fn canonical_scheme(url: &str, driver: &str) -> Zeroizing<String> {
    match url.split_once(':') {
        Some((_, rest)) => Zeroizing::new(format!("{driver}:{rest}")),
        None => Zeroizing::new(url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_name_normalization() {
        assert_eq!(driver_name("PostgreSQL+asyncpg://u@h/db").unwrap(), "postgresql");
        assert_eq!(driver_name("sqlite:///tmp/x.db").unwrap(), "sqlite");
        assert!(driver_name("no-scheme").is_err());
    }

    #[test]
    fn test_lookup_by_alias() {
        assert_eq!(lookup_engine("postgres").unwrap().driver, "postgresql");
        assert_eq!(lookup_engine("mariadb").unwrap().backend, Backend::MySql);
        assert_eq!(lookup_engine("SQLSERVER").unwrap().default_port, Some(1433));
    }

    #[test]
    fn test_unknown_driver_is_unsupported_backend() {
        let err = lookup_engine("oracle").unwrap_err();
        assert!(matches!(err, SourceGateError::UnsupportedBackend { .. }));
        assert!(err.to_string().contains("postgresql"));
    }

    #[test]
    fn test_engine_table_matches_tunnel_policy() {
        let tunnelable: Vec<&str> = ENGINES
            .iter()
            .filter(|spec| spec.tunnelable)
            .map(|spec| spec.driver)
            .collect();
        assert_eq!(tunnelable, vec!["postgresql", "mysql", "mssql"]);
        assert!(ENGINES.iter().all(|spec| spec.async_engine.is_some() || spec.sync_engine.is_some()));
    }

    #[test]
    fn test_engine_table_serializes_without_constructors() {
        let json = serde_json::to_value(lookup_engine("sqlite").unwrap()).unwrap();
        assert_eq!(json["asyncEngine"], "sqlite+sqlx");
        assert_eq!(json["syncEngine"], "sqlite+rusqlite");
        assert!(json.get("asyncConnect").is_none());
    }

    #[test]
    fn test_canonical_scheme() {
        assert_eq!(
            canonical_scheme("postgres+asyncpg://u:p@h/db", "postgresql").as_str(),
            "postgresql://u:p@h/db"
        );
        assert_eq!(canonical_scheme("sqlite::memory:", "sqlite").as_str(), "sqlite::memory:");
    }

    /// Executor that only reports which constructor built it.
    struct Stub(&'static str);

    #[async_trait::async_trait]
    impl QueryExecutor for Stub {
        fn engine(&self) -> &'static str {
            self.0
        }

        fn backend(&self) -> Backend {
            Backend::Sqlite
        }

        async fn execute(&self, _sql: &str, _max_rows: usize) -> Result<crate::models::QueryResult> {
            Err(SourceGateError::query("stub executor runs nothing"))
        }
    }

    static SYNC_CALLS_AFTER_REFUSAL: std::sync::atomic::AtomicUsize =
        std::sync::atomic::AtomicUsize::new(0);

    fn async_missing<'a>(
        _url: &'a str,
        _config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
        Box::pin(async { Err(SourceGateError::async_unavailable("stubdb", "no async driver")) })
    }

    fn async_refused<'a>(
        _url: &'a str,
        _config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
        Box::pin(async { Err(SourceGateError::connection("stub server refused the login")) })
    }

    fn sync_ok<'a>(
        url: &'a str,
        _config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
        Box::pin(async move {
            if url.starts_with("stubdb://") {
                Ok(Box::new(Stub("stubdb+sync")) as Box<dyn QueryExecutor>)
            } else {
                Err(SourceGateError::configuration(format!("unexpected scheme in {url}")))
            }
        })
    }

    fn sync_counted<'a>(
        _url: &'a str,
        _config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, Result<Box<dyn QueryExecutor>>> {
        SYNC_CALLS_AFTER_REFUSAL.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async { Ok(Box::new(Stub("stubdb+sync")) as Box<dyn QueryExecutor>) })
    }

    const fn stub_engine(
        async_connect: Option<Constructor>,
        sync_connect: Option<Constructor>,
    ) -> EngineSpec {
        EngineSpec {
            driver: "stubdb",
            names: &["stubdb", "stubdb+legacy"],
            backend: Backend::Sqlite,
            async_engine: Some("stubdb+async"),
            sync_engine: Some("stubdb+sync"),
            tunnelable: false,
            default_port: None,
            async_connect,
            sync_connect,
        }
    }

    static FALLS_BACK: EngineSpec = stub_engine(Some(async_missing), Some(sync_ok));
    static REFUSES: EngineSpec = stub_engine(Some(async_refused), Some(sync_counted));
    static NO_SYNC: EngineSpec = stub_engine(Some(async_missing), None);

    #[tokio::test]
    async fn test_async_unavailable_falls_back_to_sync_engine() {
        let config = ConnectionConfig::default();
        let executor = connect_engine(&FALLS_BACK, "stubdb+legacy://host/db", &config)
            .await
            .unwrap();
        assert_eq!(executor.engine(), "stubdb+sync");
    }

    #[tokio::test]
    async fn test_other_async_errors_do_not_fall_back() {
        let config = ConnectionConfig::default();
        let err = connect_engine(&REFUSES, "stubdb://host/db", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceGateError::Connection { .. }));
        assert!(err.to_string().contains("stub server refused the login"));
        assert_eq!(SYNC_CALLS_AFTER_REFUSAL.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_async_unavailable_without_sync_engine_is_unsupported() {
        let config = ConnectionConfig::default();
        let err = connect_engine(&NO_SYNC, "stubdb://host/db", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SourceGateError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn test_tunnel_on_non_tunnelable_driver_fails_fast() {
        let config = ConnectionConfig::default();
        let cancel = CancellationToken::new();
        let connector = crate::tunnel::SshConnector::new();
        let context = FactoryContext {
            config: &config,
            secrets: &crate::security::NoSecrets,
            connector: &connector,
            cancel: &cancel,
        };
        let err = create_database_connection(
            "bigquery://proj/dataset?ssh_host=b&ssh_user=u&ssh_password=x",
            &context,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceGateError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn test_unknown_driver_fails_before_connecting() {
        let config = ConnectionConfig::default();
        let cancel = CancellationToken::new();
        let connector = crate::tunnel::SshConnector::new();
        let context = FactoryContext {
            config: &config,
            secrets: &crate::security::NoSecrets,
            connector: &connector,
            cancel: &cancel,
        };
        let err = create_database_connection("oracle://u:p@h/db", &context)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceGateError::UnsupportedBackend { .. }));
    }
}
