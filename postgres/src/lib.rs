//! `PostgreSQL` backing store for scoped units of work.
//!
//! This crate implements the session traits of `scoped-uow-core` on top of
//! sqlx connection pools:
//!
//! - One [`PgSession`] (one `PgPool`) per session key
//! - Transactions begun with the pool default or an explicit isolation level
//! - A transaction handle that rolls back anything still open on dispose
//! - [`connection_for`] so actions can run queries inside the unit of work
//!
//! # Example
//!
//! ```ignore
//! use scoped_uow_postgres::{PgSessionProvider, PostgresSessionConfig};
//!
//! async fn example(registry: &ServiceRegistry) -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PostgresSessionConfig::from_env()?;
//!     let sessions = PgSessionProvider::new().connect("default", &config).await?;
//!     registry.register_instance::<Arc<dyn SessionProvider>>(Arc::new(sessions))?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use scoped_uow_core::{
    ActionContext, Error, IsolationLevel, Session, SessionProvider, StoreFuture, Transaction,
    TransactionError,
};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, Postgres};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Connection settings for one session key.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresSessionConfig {
    url: String,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PostgresSessionConfig {
    /// Settings for `url` with default pool sizing (10 connections, 5s acquire timeout).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    /// Read `DATABASE_URL` (required) and `DATABASE_MAX_CONNECTIONS` (optional).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `DATABASE_URL` is unset or
    /// `DATABASE_MAX_CONNECTIONS` is not a number.
    pub fn from_env() -> Result<Self, Error> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|source| Error::configuration_with("DATABASE_URL must be set", source))?;

        let mut config = Self::new(url);
        if let Ok(value) = std::env::var("DATABASE_MAX_CONNECTIONS") {
            let max_connections = value.parse().map_err(|source| {
                Error::configuration_with(
                    format!("DATABASE_MAX_CONNECTIONS must be a number, got '{value}'"),
                    source,
                )
            })?;
            config = config.with_max_connections(max_connections);
        }
        Ok(config)
    }

    /// Set the pool size.
    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set how long to wait for a pooled connection.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, acquire_timeout: Duration) -> Self {
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pool size.
    #[must_use]
    pub const fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Pooled connection wait limit.
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }
}

// The URL may carry a password.
impl fmt::Debug for PostgresSessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSessionConfig")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}

/// `SET TRANSACTION` statement for `level`; `None` keeps the server default.
#[must_use]
pub const fn isolation_statement(level: IsolationLevel) -> Option<&'static str> {
    match level {
        IsolationLevel::Unspecified => None,
        IsolationLevel::ReadUncommitted => Some("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED"),
        IsolationLevel::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
        IsolationLevel::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
        IsolationLevel::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
    }
}

/// Session provider mapping session keys to connection pools.
#[derive(Debug, Clone, Default)]
pub struct PgSessionProvider {
    sessions: HashMap<String, Arc<PgSession>>,
}

impl PgSessionProvider {
    /// Provider without sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `key` from an existing pool.
    #[must_use]
    pub fn with_pool(mut self, key: impl Into<String>, pool: PgPool) -> Self {
        let key = key.into();
        self.sessions
            .insert(key.clone(), Arc::new(PgSession { key, pool }));
        self
    }

    /// Open a pool for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the database cannot be reached.
    pub async fn connect(
        self,
        key: impl Into<String>,
        config: &PostgresSessionConfig,
    ) -> Result<Self, Error> {
        let key = key.into();
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|source| {
                Error::configuration_with(format!("failed to connect session '{key}'"), source)
            })?;

        tracing::info!(
            session_key = %key,
            max_connections = config.max_connections,
            "Connected PostgreSQL session"
        );
        Ok(self.with_pool(key, pool))
    }

    /// Pool serving `key`.
    #[must_use]
    pub fn pool(&self, key: &str) -> Option<&PgPool> {
        self.sessions.get(key).map(|session| &session.pool)
    }

    /// Configured session keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }
}

impl SessionProvider for PgSessionProvider {
    fn current_session_for(&self, key: &str) -> Result<Arc<dyn Session>, TransactionError> {
        self.sessions
            .get(key)
            .map(|session| Arc::clone(session) as Arc<dyn Session>)
            .ok_or_else(|| TransactionError::UnknownSession(key.to_string()))
    }
}

/// One session key backed by a pool.
#[derive(Debug)]
pub struct PgSession {
    key: String,
    pool: PgPool,
}

impl PgSession {
    /// Session key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Backing pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self, level: IsolationLevel) -> Result<Box<dyn Transaction>, TransactionError> {
        let mut transaction = self
            .pool
            .begin()
            .await
            .map_err(|source| TransactionError::database("begin", source))?;

        // Must be the first statement of the transaction.
        if let Some(statement) = isolation_statement(level) {
            sqlx::query(statement)
                .execute(&mut *transaction)
                .await
                .map_err(|source| TransactionError::database("begin", source))?;
        }

        tracing::debug!(session_key = %self.key, isolation_level = %level, "Began PostgreSQL transaction");
        Ok(Box::new(PgTransaction {
            key: self.key.clone(),
            inner: Some(transaction),
        }))
    }
}

impl Session for PgSession {
    fn begin_transaction(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(self.begin(IsolationLevel::Unspecified))
    }

    fn begin_transaction_with(
        &self,
        isolation_level: IsolationLevel,
    ) -> StoreFuture<'_, Box<dyn Transaction>> {
        Box::pin(self.begin(isolation_level))
    }
}

/// An open sqlx transaction.
pub struct PgTransaction {
    key: String,
    inner: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PgTransaction {
    /// Session key the transaction belongs to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Connection to run queries on, while the transaction is open.
    pub fn connection(&mut self) -> Option<&mut PgConnection> {
        self.inner.as_deref_mut()
    }
}

impl fmt::Debug for PgTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgTransaction")
            .field("key", &self.key)
            .field("active", &self.inner.is_some())
            .finish()
    }
}

impl Transaction for PgTransaction {
    fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    fn commit(&mut self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let transaction = self.inner.take().ok_or(TransactionError::NotActive)?;
            transaction
                .commit()
                .await
                .map_err(|source| TransactionError::database("commit", source))
        })
    }

    fn rollback(&mut self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let transaction = self.inner.take().ok_or(TransactionError::NotActive)?;
            transaction
                .rollback()
                .await
                .map_err(|source| TransactionError::database("rollback", source))
        })
    }

    fn dispose(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(transaction) = self.inner.take() else {
                return;
            };
            if let Err(error) = transaction.rollback().await {
                metrics::counter!("postgres.dispose.rollback_failed", "session_key" => self.key.clone())
                    .increment(1);
                tracing::warn!(
                    session_key = %self.key,
                    error = %error,
                    "Failed to roll back abandoned transaction"
                );
            }
        })
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Connection of the open `PostgreSQL` unit of work for `key`, if any.
pub fn connection_for<'a>(context: &'a mut ActionContext, key: &str) -> Option<&'a mut PgConnection> {
    context
        .units_of_work_mut()
        .get_mut(key)?
        .transaction_mut::<PgTransaction>()?
        .connection()
}
