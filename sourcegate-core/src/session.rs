//! Session-scoped registry of live datasources.
//!
//! A [`Session`] owns every datasource created through it. Sources are keyed
//! by their sanitized URL: asking twice for the same URL returns the same
//! `Arc`, and concurrent first requests share a single connection attempt.
//! Sessions never see each other's sources.
//!
//! # Example
//! ```rust,no_run
//! use sourcegate_core::{Session, config::SessionConfig};
//!
//! # async fn example() -> sourcegate_core::Result<()> {
//! let session = Session::new(SessionConfig::default())?;
//! let source = session.get_or_create("sqlite:///var/data/app.db").await?;
//! let tables = source.as_database()?.list_tables().await?;
//! println!("{tables:?}");
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::SessionConfig;
use crate::datasources::{Datasource, DatasourceContext};
use crate::security::{ConnectionUrl, EnvSecretSource, SecretSource, sanitize_url};
use crate::tunnel::{SshConnector, TunnelConnector};
use crate::{Result, error::SourceGateError};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A creation attempt shared by every caller asking for the same URL.
type PendingSource = Shared<BoxFuture<'static, Result<Arc<Datasource>>>>;

/// Registry state replaced wholesale on reset.
struct Registry {
    /// Parent token of every creation and source in this generation
    generation: CancellationToken,
    sources: HashMap<String, PendingSource>,
}

/// One caller context and the datasources opened in it.
pub struct Session {
    id: Uuid,
    config: Arc<SessionConfig>,
    secrets: Arc<dyn SecretSource>,
    connector: Arc<dyn TunnelConnector>,
    root: CancellationToken,
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("sources", &self.urls())
            .field("closed", &self.root.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Creates a session that reads `{password}` from `DATABASE_PASSWORD`
    /// and opens tunnels with russh.
    ///
    /// # Errors
    /// Returns `Configuration` when `config` is invalid
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let root = CancellationToken::new();
        let id = Uuid::new_v4();
        tracing::debug!(session = %id, "Session created");

        Ok(Self {
            id,
            config: Arc::new(config),
            secrets: Arc::new(EnvSecretSource::default()),
            connector: Arc::new(SshConnector::new()),
            registry: Mutex::new(Registry {
                generation: root.child_token(),
                sources: HashMap::new(),
            }),
            root,
        })
    }

    /// Replaces the secret source.
    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretSource>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Replaces the SSH connector.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn TunnelConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Unique session id, used in logs.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Session limits.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Sanitized URLs currently registered, connected or still connecting.
    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.registry.lock().sources.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Returns the datasource for `url`, creating it on first use.
    ///
    /// Concurrent calls for the same sanitized URL wait on one creation and
    /// all receive its outcome. A failed creation is not cached; the next
    /// call tries again.
    ///
    /// # Errors
    /// Returns `Cancelled` after [`Session::close`], otherwise the creation
    /// error
    pub async fn get_or_create(&self, url: &str) -> Result<Arc<Datasource>> {
        if self.root.is_cancelled() {
            return Err(SourceGateError::cancelled(format!("session {} is closed", self.id)));
        }

        let url = ConnectionUrl::new(url);
        let key = url.sanitized().to_string();

        let pending = {
            let mut registry = self.registry.lock();
            if let Some(pending) = registry.sources.get(&key) {
                pending.clone()
            } else {
                let context = DatasourceContext {
                    config: Arc::clone(&self.config),
                    secrets: Arc::clone(&self.secrets),
                    connector: Arc::clone(&self.connector),
                    cancel: registry.generation.child_token(),
                };
                tracing::debug!(session = %self.id, url = %key, "Creating datasource");
                let pending = async move { Datasource::open(&url, &context).await.map(Arc::new) }
                    .boxed()
                    .shared();
                registry.sources.insert(key.clone(), pending.clone());
                pending
            }
        };

        let outcome = pending.clone().await;
        if outcome.is_err() {
            let mut registry = self.registry.lock();
            if registry
                .sources
                .get(&key)
                .is_some_and(|current| current.ptr_eq(&pending))
            {
                registry.sources.remove(&key);
            }
        }
        outcome
    }

    /// Returns an already connected datasource without creating one.
    ///
    /// # Errors
    /// Returns `NotFound` when this session has no connected source for `url`
    pub fn lookup(&self, url: &str) -> Result<Arc<Datasource>> {
        let key = sanitize_url(url);
        let registry = self.registry.lock();
        match registry.sources.get(&key).and_then(Shared::peek) {
            Some(Ok(source)) => Ok(Arc::clone(source)),
            _ => Err(SourceGateError::not_found(format!(
                "datasource {key} in session {}",
                self.id
            ))),
        }
    }

    /// Closes every source and starts over with an empty registry.
    ///
    /// Creations still in flight are cancelled. Handles obtained before the
    /// reset are closed and must not be used afterwards.
    pub async fn reset(&self) {
        let drained = {
            let mut registry = self.registry.lock();
            let next = Registry {
                generation: self.root.child_token(),
                sources: HashMap::new(),
            };
            std::mem::replace(&mut *registry, next)
        };
        drained.generation.cancel();
        let count = drained.sources.len();
        close_all(drained.sources).await;
        tracing::debug!(session = %self.id, closed = count, "Session reset");
    }

    /// Closes every source. Later calls to [`Session::get_or_create`] fail.
    pub async fn close(&self) {
        self.root.cancel();
        let sources = std::mem::take(&mut self.registry.lock().sources);
        let count = sources.len();
        close_all(sources).await;
        tracing::debug!(session = %self.id, closed = count, "Session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Stops forwarding tasks and statements of sources nobody closed
        self.root.cancel();
    }
}

async fn close_all(sources: HashMap<String, PendingSource>) {
    for (url, pending) in sources {
        if let Some(Ok(source)) = pending.peek() {
            tracing::debug!(url = %url, "Closing datasource");
            source.close().await;
        }
    }
}
