//! Request-scoped units of work.
//!
//! [`TransactionFilter`] wraps one action execution in a transaction taken
//! from a backing store:
//!
//! ```text
//! Closed --before_action--> Open --after_action--> Committed | RolledBack --release--> Closed
//! ```
//!
//! The store is reached through three narrow traits ([`SessionProvider`],
//! [`Session`], [`Transaction`]). The open transaction is kept in the
//! request's [`ActionContext`] under its session key, so `after_action` finds
//! exactly the handle `before_action` opened for this request and never one
//! belonging to another request.
//!
//! # Example
//!
//! ```ignore
//! let mut configuration = HttpConfiguration::new();
//! configuration.filters_mut().add(|| {
//!     TransactionFilter::for_session("orders")
//!         .with_isolation_level(IsolationLevel::Serializable)
//!         .with_rollback_on_invalid_input(true)
//! });
//! ```

use crate::context::{ActionContext, ActionExecutedContext, ActionFault};
use crate::error::{BoxError, Error, Result};
use crate::filter::{ActionFilter, FilterFuture};
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

/// Key used when a filter has no explicit session key and nobody changed the
/// process default.
pub const DEFAULT_SESSION_KEY: &str = "default";

static DEFAULT_KEY: LazyLock<RwLock<String>> =
    LazyLock::new(|| RwLock::new(DEFAULT_SESSION_KEY.to_string()));

/// Current process-wide default session key.
#[must_use]
pub fn default_session_key() -> String {
    DEFAULT_KEY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Replace the process-wide default session key.
pub fn set_default_session_key(key: impl Into<String>) {
    *DEFAULT_KEY.write().unwrap_or_else(PoisonError::into_inner) = key.into();
}

/// Source of the fallback session key.
pub trait SessionKeyProvider: Send + Sync {
    /// Key to use when no explicit key is configured.
    fn default_key(&self) -> String;
}

/// Reads [`default_session_key`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessDefaultKey;

impl SessionKeyProvider for ProcessDefaultKey {
    fn default_key(&self) -> String {
        default_session_key()
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Use whatever the backing store defaults to.
    #[default]
    Unspecified,
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Only committed data is read.
    ReadCommitted,
    /// Rows read stay stable for the whole transaction.
    RepeatableRead,
    /// Full serializability.
    Serializable,
}

impl IsolationLevel {
    /// Whether a level other than the store default was requested.
    #[must_use]
    pub const fn is_specified(self) -> bool {
        !matches!(self, Self::Unspecified)
    }

    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::ReadUncommitted => "read uncommitted",
            Self::ReadCommitted => "read committed",
            Self::RepeatableRead => "repeatable read",
            Self::Serializable => "serializable",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the backing store or by misuse of a unit of work.
#[derive(Error, Debug)]
pub enum TransactionError {
    /// No session is configured for the key.
    #[error("no session configured for key '{0}'")]
    UnknownSession(String),

    /// Commit or rollback was requested on a closed unit of work.
    #[error("unit of work is not active")]
    NotActive,

    /// The store failed to begin, commit, or roll back.
    #[error("failed to {operation} transaction")]
    Database {
        /// `begin`, `commit`, or `rollback`.
        operation: &'static str,
        /// Store error.
        #[source]
        source: BoxError,
    },
}

impl TransactionError {
    /// Wrap a store error raised during `operation`.
    pub fn database(
        operation: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Database {
            operation,
            source: Box::new(source),
        }
    }
}

/// Future returned by store operations.
pub type StoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, TransactionError>> + Send + 'a>>;

/// An open transaction on the backing store.
///
/// # Dyn Compatibility
///
/// Operations return boxed futures so the handle can live behind
/// `Box<dyn Transaction>`.
pub trait Transaction: Send {
    /// Whether commit or rollback is still possible.
    fn is_active(&self) -> bool;

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if the store rejects the commit.
    fn commit(&mut self) -> StoreFuture<'_, ()>;

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if the store rejects the rollback.
    fn rollback(&mut self) -> StoreFuture<'_, ()>;

    /// Release the underlying resources. Must not fail; anything still open
    /// is abandoned.
    fn dispose(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Concrete handle, for [`UnitOfWork::transaction_mut`].
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A session of the backing store that can open transactions.
pub trait Session: Send + Sync {
    /// Begin with the store's default isolation level.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if the store cannot open a transaction.
    fn begin_transaction(&self) -> StoreFuture<'_, Box<dyn Transaction>>;

    /// Begin with an explicit isolation level.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError`] if the store cannot open a transaction or
    /// rejects the level.
    fn begin_transaction_with(
        &self,
        isolation_level: IsolationLevel,
    ) -> StoreFuture<'_, Box<dyn Transaction>>;
}

/// Maps session keys to sessions.
pub trait SessionProvider: Send + Sync {
    /// The session for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::UnknownSession`] for an unconfigured key.
    fn current_session_for(&self, key: &str) -> std::result::Result<Arc<dyn Session>, TransactionError>;
}

/// How a unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Neither committed nor rolled back yet.
    Pending,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

/// One transaction bound to one request and session key.
pub struct UnitOfWork {
    session_key: String,
    isolation_level: IsolationLevel,
    outcome: Outcome,
    opened_at: DateTime<Utc>,
    transaction: Box<dyn Transaction>,
}

impl UnitOfWork {
    /// Wrap a freshly begun transaction.
    #[must_use]
    pub fn new(
        session_key: impl Into<String>,
        isolation_level: IsolationLevel,
        transaction: Box<dyn Transaction>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            isolation_level,
            outcome: Outcome::Pending,
            opened_at: Utc::now(),
            transaction,
        }
    }

    /// Session key this unit of work belongs to.
    #[must_use]
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Isolation level it was opened with.
    #[must_use]
    pub const fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Current outcome.
    #[must_use]
    pub const fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// When the transaction was begun.
    #[must_use]
    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Whether the unit of work can still be committed or rolled back.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.outcome == Outcome::Pending && self.transaction.is_active()
    }

    /// Commit.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotActive`] if already closed, otherwise whatever
    /// the store reports.
    pub async fn commit(&mut self) -> std::result::Result<(), TransactionError> {
        if !self.is_active() {
            return Err(TransactionError::NotActive);
        }
        self.transaction.commit().await?;
        self.outcome = Outcome::Committed;

        metrics::counter!("unit_of_work.committed", "session_key" => self.session_key.clone())
            .increment(1);
        debug!(session_key = %self.session_key, "Committed unit of work");
        Ok(())
    }

    /// Roll back.
    ///
    /// # Errors
    ///
    /// [`TransactionError::NotActive`] if already closed, otherwise whatever
    /// the store reports.
    pub async fn rollback(&mut self) -> std::result::Result<(), TransactionError> {
        if !self.is_active() {
            return Err(TransactionError::NotActive);
        }
        self.transaction.rollback().await?;
        self.outcome = Outcome::RolledBack;

        metrics::counter!("unit_of_work.rolled_back", "session_key" => self.session_key.clone())
            .increment(1);
        debug!(session_key = %self.session_key, "Rolled back unit of work");
        Ok(())
    }

    /// Dispose the transaction. Consumes the handle: a released unit of work
    /// is closed for good.
    pub async fn release(mut self) {
        self.transaction.dispose().await;

        let elapsed_ms = (Utc::now() - self.opened_at).num_milliseconds();
        debug!(
            session_key = %self.session_key,
            outcome = ?self.outcome,
            elapsed_ms,
            "Released unit of work"
        );
    }

    /// The concrete store transaction, if it is a `T`.
    pub fn transaction_mut<T: Transaction + 'static>(&mut self) -> Option<&mut T> {
        self.transaction.as_any_mut().downcast_mut::<T>()
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("session_key", &self.session_key)
            .field("isolation_level", &self.isolation_level)
            .field("outcome", &self.outcome)
            .field("opened_at", &self.opened_at)
            .finish_non_exhaustive()
    }
}

/// Units of work opened for one request, at most one per session key.
#[derive(Debug, Default)]
pub struct UnitsOfWork {
    units: HashMap<String, UnitOfWork>,
}

impl UnitsOfWork {
    /// The unit of work for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&UnitOfWork> {
        self.units.get(key)
    }

    /// The unit of work for `key`, mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut UnitOfWork> {
        self.units.get_mut(key)
    }

    /// Store `unit` under its session key, returning the one it replaced.
    pub fn insert(&mut self, unit: UnitOfWork) -> Option<UnitOfWork> {
        self.units.insert(unit.session_key.clone(), unit)
    }

    /// Remove and return the unit of work for `key`.
    pub fn take(&mut self, key: &str) -> Option<UnitOfWork> {
        self.units.remove(key)
    }

    /// Whether a unit of work is stored for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.units.contains_key(key)
    }

    /// Session keys with a stored unit of work.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.units.keys().map(String::as_str)
    }

    /// Number of stored units of work.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Action filter that runs the action inside a unit of work.
///
/// The session provider is a property-injected member: register an
/// `Arc<dyn SessionProvider>` in the registry and the filter aggregator will
/// set it before the filter runs.
#[derive(crate::Injectable)]
pub struct TransactionFilter {
    /// Source of store sessions.
    pub sessions: Option<Arc<dyn SessionProvider>>,
    session_key: Option<String>,
    isolation_level: IsolationLevel,
    rollback_on_invalid_input: bool,
    key_provider: Arc<dyn SessionKeyProvider>,
}

impl TransactionFilter {
    /// Filter on the process default session key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: None,
            session_key: None,
            isolation_level: IsolationLevel::Unspecified,
            rollback_on_invalid_input: false,
            key_provider: Arc::new(ProcessDefaultKey),
        }
    }

    /// Filter on an explicit session key.
    #[must_use]
    pub fn for_session(key: impl Into<String>) -> Self {
        Self {
            session_key: Some(key.into()),
            ..Self::new()
        }
    }

    /// Set the isolation level (default: store default).
    #[must_use]
    pub const fn with_isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.isolation_level = isolation_level;
        self
    }

    /// Roll back when the action's input is invalid, even without a fault.
    #[must_use]
    pub const fn with_rollback_on_invalid_input(mut self, enabled: bool) -> Self {
        self.rollback_on_invalid_input = enabled;
        self
    }

    /// Replace the source of the fallback session key.
    #[must_use]
    pub fn with_key_provider(mut self, provider: Arc<dyn SessionKeyProvider>) -> Self {
        self.key_provider = provider;
        self
    }

    /// Set the session provider directly, bypassing injection.
    #[must_use]
    pub fn with_sessions(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Explicit session key, if any.
    #[must_use]
    pub fn session_key(&self) -> Option<&str> {
        self.session_key.as_deref()
    }

    /// Configured isolation level.
    #[must_use]
    pub const fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    /// Whether invalid input forces a rollback.
    #[must_use]
    pub const fn rollback_on_invalid_input(&self) -> bool {
        self.rollback_on_invalid_input
    }

    /// The explicit key, or the key provider's current default.
    #[must_use]
    pub fn effective_session_key(&self) -> String {
        self.session_key
            .clone()
            .unwrap_or_else(|| self.key_provider.default_key())
    }

    async fn begin(&self, context: &mut ActionContext) -> Result<()> {
        let key = self.effective_session_key();

        if let Some(existing) = context.units_of_work_mut().take(&key) {
            if existing.is_active() {
                debug!(session_key = %key, "Joining open unit of work");
                context.units_of_work_mut().insert(existing);
                return Ok(());
            }
            existing.release().await;
        }

        let sessions = self.sessions.as_ref().ok_or_else(|| {
            Error::configuration(format!(
                "no session provider injected into TransactionFilter for key '{key}'"
            ))
        })?;
        let session = sessions.current_session_for(&key)?;

        let transaction = if self.isolation_level.is_specified() {
            session.begin_transaction_with(self.isolation_level).await
        } else {
            session.begin_transaction().await
        };
        let transaction = transaction.inspect_err(|error| {
            metrics::counter!("unit_of_work.failed", "session_key" => key.clone()).increment(1);
            warn!(session_key = %key, error = %error, "Failed to begin unit of work");
        })?;

        metrics::counter!("unit_of_work.begun", "session_key" => key.clone()).increment(1);
        debug!(
            session_key = %key,
            isolation_level = %self.isolation_level,
            "Began unit of work"
        );

        context
            .units_of_work_mut()
            .insert(UnitOfWork::new(key, self.isolation_level, transaction));
        Ok(())
    }

    async fn complete(&self, executed: &mut ActionExecutedContext) -> Result<()> {
        let key = self.effective_session_key();

        let Some(mut unit) = executed.context_mut().units_of_work_mut().take(&key) else {
            debug!(session_key = %key, "No unit of work to complete");
            return Ok(());
        };

        if !unit.is_active() {
            debug!(session_key = %key, "Unit of work already closed");
            unit.release().await;
            return Ok(());
        }

        let rollback = executed.fault().is_some()
            || (self.rollback_on_invalid_input && !executed.context().model_state().is_valid());

        let outcome = if rollback {
            unit.rollback().await
        } else {
            unit.commit().await
        };

        unit.release().await;

        let operation = if rollback { "rollback" } else { "commit" };
        outcome.map_err(|error| {
            metrics::counter!("unit_of_work.failed", "session_key" => key.clone()).increment(1);
            warn!(
                session_key = %key,
                operation,
                error = %error,
                "Failed to complete unit of work"
            );
            Error::from(error)
        })
    }
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionFilter")
            .field("sessions", &self.sessions.is_some())
            .field("session_key", &self.session_key)
            .field("isolation_level", &self.isolation_level)
            .field("rollback_on_invalid_input", &self.rollback_on_invalid_input)
            .finish_non_exhaustive()
    }
}

impl ActionFilter for TransactionFilter {
    fn before_action<'a>(&'a self, context: &'a mut ActionContext) -> FilterFuture<'a> {
        Box::pin(async move { self.begin(context).await.map_err(ActionFault::from) })
    }

    fn after_action<'a>(&'a self, executed: &'a mut ActionExecutedContext) -> FilterFuture<'a> {
        Box::pin(async move { self.complete(executed).await.map_err(ActionFault::from) })
    }
}
