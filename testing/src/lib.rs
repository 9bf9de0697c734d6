//! # Scoped UoW Testing
//!
//! Testing utilities for unit-of-work filters and the action pipeline.
//!
//! This crate provides:
//! - A recording session provider whose transactions log every call in order
//!   and can be told to fail
//! - A fixed session-key provider
//! - A scripted controller
//! - [`ActionTest`], a Given-When-Then harness around [`execute_action`]
//!
//! ## Example
//!
//! ```ignore
//! use scoped_uow_testing::{ActionTest, Call, RecordingSessionProvider, Script};
//!
//! #[tokio::test]
//! async fn test_commit_on_success() {
//!     let sessions = RecordingSessionProvider::new();
//!
//!     ActionTest::new()
//!         .with_filter(TransactionFilter::for_session("main").with_sessions(sessions.shared()))
//!         .when(Script::respond(ActionResult::no_content()))
//!         .then_outcome(|executed| assert!(executed.fault().is_none()))
//!         .run()
//!         .await;
//!
//!     assert_eq!(sessions.log().calls().len(), 3);
//! }
//! ```
//!
//! [`execute_action`]: scoped_uow_core::execute_action


pub use action_test::ActionTest;

/// Recording fakes for the backing store and the pipeline.
pub mod mocks {
    use scoped_uow_core::{
        ActionContext, ActionFuture, ActionResult, HttpController, IsolationLevel, Session,
        SessionKeyProvider, SessionProvider, StoreFuture, Transaction, TransactionError,
    };
    use std::any::Any;
    use std::collections::HashSet;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// One call made against the fake store.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        /// A transaction was begun.
        Begin {
            /// Session key.
            key: String,
            /// Requested isolation level (`Unspecified` for the default begin).
            isolation_level: IsolationLevel,
        },
        /// Commit was called.
        Commit {
            /// Session key.
            key: String,
        },
        /// Rollback was called.
        Rollback {
            /// Session key.
            key: String,
        },
        /// Dispose was called.
        Dispose {
            /// Session key.
            key: String,
        },
    }

    impl Call {
        /// Short name of the call, without its key.
        #[must_use]
        pub const fn name(&self) -> &'static str {
            match self {
                Self::Begin { .. } => "begin",
                Self::Commit { .. } => "commit",
                Self::Rollback { .. } => "rollback",
                Self::Dispose { .. } => "dispose",
            }
        }
    }

    /// Ordered, shared log of store calls.
    #[derive(Debug, Clone, Default)]
    pub struct CallLog {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl CallLog {
        /// Create an empty log.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Append a call.
        pub fn push(&self, call: Call) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
        }

        /// Snapshot of all calls so far.
        #[must_use]
        pub fn calls(&self) -> Vec<Call> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Call names in order, e.g. `["begin", "commit", "dispose"]`.
        #[must_use]
        pub fn names(&self) -> Vec<&'static str> {
            self.calls().iter().map(Call::name).collect()
        }

        /// Number of calls named `name`.
        #[must_use]
        pub fn count(&self, name: &str) -> usize {
            self.calls().iter().filter(|call| call.name() == name).count()
        }

        /// Forget every call.
        pub fn clear(&self) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    #[derive(Debug, Default)]
    struct Failures {
        begin: AtomicBool,
        commit: AtomicBool,
        rollback: AtomicBool,
    }

    fn refused(operation: &'static str) -> TransactionError {
        TransactionError::database(operation, std::io::Error::other(format!("{operation} refused")))
    }

    /// Session provider whose transactions record into a [`CallLog`].
    ///
    /// Accepts every key unless restricted with [`RecordingSessionProvider::with_keys`].
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSessionProvider {
        log: CallLog,
        keys: Option<HashSet<String>>,
        failures: Arc<Failures>,
    }

    impl RecordingSessionProvider {
        /// Provider accepting any session key.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Only accept the given keys; others fail with `UnknownSession`.
        #[must_use]
        pub fn with_keys<I, K>(mut self, keys: I) -> Self
        where
            I: IntoIterator<Item = K>,
            K: Into<String>,
        {
            self.keys = Some(keys.into_iter().map(Into::into).collect());
            self
        }

        /// The shared call log.
        #[must_use]
        pub fn log(&self) -> &CallLog {
            &self.log
        }

        /// This provider as the trait object the registry and filters expect.
        #[must_use]
        pub fn shared(&self) -> Arc<dyn SessionProvider> {
            Arc::new(self.clone())
        }

        /// Make every following begin fail.
        pub fn fail_begin(&self) {
            self.failures.begin.store(true, Ordering::SeqCst);
        }

        /// Make every following commit fail.
        pub fn fail_commit(&self) {
            self.failures.commit.store(true, Ordering::SeqCst);
        }

        /// Make every following rollback fail.
        pub fn fail_rollback(&self) {
            self.failures.rollback.store(true, Ordering::SeqCst);
        }
    }

    impl SessionProvider for RecordingSessionProvider {
        fn current_session_for(&self, key: &str) -> Result<Arc<dyn Session>, TransactionError> {
            if self.keys.as_ref().is_some_and(|keys| !keys.contains(key)) {
                return Err(TransactionError::UnknownSession(key.to_string()));
            }
            Ok(Arc::new(RecordingSession {
                key: key.to_string(),
                log: self.log.clone(),
                failures: Arc::clone(&self.failures),
            }))
        }
    }

    struct RecordingSession {
        key: String,
        log: CallLog,
        failures: Arc<Failures>,
    }

    impl RecordingSession {
        fn begin(&self, isolation_level: IsolationLevel) -> Result<Box<dyn Transaction>, TransactionError> {
            if self.failures.begin.load(Ordering::SeqCst) {
                return Err(refused("begin"));
            }
            self.log.push(Call::Begin {
                key: self.key.clone(),
                isolation_level,
            });
            Ok(Box::new(RecordingTransaction {
                key: self.key.clone(),
                log: self.log.clone(),
                failures: Arc::clone(&self.failures),
                active: true,
            }))
        }
    }

    impl Session for RecordingSession {
        fn begin_transaction(&self) -> StoreFuture<'_, Box<dyn Transaction>> {
            Box::pin(std::future::ready(self.begin(IsolationLevel::Unspecified)))
        }

        fn begin_transaction_with(
            &self,
            isolation_level: IsolationLevel,
        ) -> StoreFuture<'_, Box<dyn Transaction>> {
            Box::pin(std::future::ready(self.begin(isolation_level)))
        }
    }

    /// Transaction handed out by [`RecordingSessionProvider`].
    #[derive(Debug)]
    pub struct RecordingTransaction {
        key: String,
        log: CallLog,
        failures: Arc<Failures>,
        active: bool,
    }

    impl RecordingTransaction {
        /// Session key it was begun for.
        #[must_use]
        pub fn key(&self) -> &str {
            &self.key
        }
    }

    impl Transaction for RecordingTransaction {
        fn is_active(&self) -> bool {
            self.active
        }

        fn commit(&mut self) -> StoreFuture<'_, ()> {
            self.active = false;
            self.log.push(Call::Commit {
                key: self.key.clone(),
            });
            let result = if self.failures.commit.load(Ordering::SeqCst) {
                Err(refused("commit"))
            } else {
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }

        fn rollback(&mut self) -> StoreFuture<'_, ()> {
            self.active = false;
            self.log.push(Call::Rollback {
                key: self.key.clone(),
            });
            let result = if self.failures.rollback.load(Ordering::SeqCst) {
                Err(refused("rollback"))
            } else {
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }

        fn dispose(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.active = false;
            self.log.push(Call::Dispose {
                key: self.key.clone(),
            });
            Box::pin(std::future::ready(()))
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Key provider returning a fixed key.
    #[derive(Debug, Clone)]
    pub struct FixedKeyProvider(pub String);

    impl FixedKeyProvider {
        /// Provider always answering `key`.
        #[must_use]
        pub fn new(key: impl Into<String>) -> Self {
            Self(key.into())
        }
    }

    impl SessionKeyProvider for FixedKeyProvider {
        fn default_key(&self) -> String {
            self.0.clone()
        }
    }

    /// What a [`ScriptedController`] does when invoked.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Return this result.
        Respond(ActionResult),
        /// Fail with this message.
        Fail(String),
        /// Record a validation error, then return `204`.
        Invalid {
            /// Argument key.
            key: String,
            /// Validation message.
            message: String,
        },
    }

    impl Script {
        /// Return `result`.
        #[must_use]
        pub const fn respond(result: ActionResult) -> Self {
            Self::Respond(result)
        }

        /// Fail with `message`.
        #[must_use]
        pub fn fail(message: impl Into<String>) -> Self {
            Self::Fail(message.into())
        }

        /// Record a validation error for `key`.
        #[must_use]
        pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
            Self::Invalid {
                key: key.into(),
                message: message.into(),
            }
        }
    }

    /// Controller following a [`Script`] and recording what it saw.
    #[derive(Debug)]
    pub struct ScriptedController {
        script: Script,
        invocations: AtomicUsize,
        open_units: Mutex<Vec<String>>,
    }

    impl ScriptedController {
        /// Controller following `script`.
        #[must_use]
        pub fn new(script: Script) -> Self {
            Self {
                script,
                invocations: AtomicUsize::new(0),
                open_units: Mutex::new(Vec::new()),
            }
        }

        /// How many times the action ran.
        #[must_use]
        pub fn invocations(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }

        /// Session keys with an active unit of work during the last invocation.
        #[must_use]
        pub fn open_units(&self) -> Vec<String> {
            self.open_units
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl HttpController for ScriptedController {
        fn invoke<'a>(&'a self, context: &'a mut ActionContext) -> ActionFuture<'a> {
            self.invocations.fetch_add(1, Ordering::SeqCst);

            let mut open: Vec<String> = context
                .units_of_work()
                .keys()
                .filter(|key| {
                    context
                        .units_of_work()
                        .get(key)
                        .is_some_and(scoped_uow_core::UnitOfWork::is_active)
                })
                .map(ToString::to_string)
                .collect();
            open.sort();
            *self
                .open_units
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = open;

            let outcome = match &self.script {
                Script::Respond(result) => Ok(result.clone()),
                Script::Fail(message) => Err(anyhow::anyhow!(message.clone())),
                Script::Invalid { key, message } => {
                    context.model_state_mut().add_error(key.clone(), message.clone());
                    Ok(ActionResult::no_content())
                }
            };
            Box::pin(std::future::ready(outcome))
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use scoped_uow_core::ActionContext;

    /// Head of an empty `GET /` request.
    #[must_use]
    pub fn request_parts() -> http::request::Parts {
        http::Request::new(()).into_parts().0
    }

    /// Fresh context for `controller`/`action`.
    #[must_use]
    pub fn action_context(controller: &str, action: &str) -> ActionContext {
        ActionContext::new(controller, action, request_parts())
    }

    /// Install a test `tracing` subscriber honouring `RUST_LOG`.
    ///
    /// Safe to call from many tests; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

pub use helpers::{action_context, init_tracing, request_parts};
pub use mocks::{
    Call, CallLog, FixedKeyProvider, RecordingSessionProvider, RecordingTransaction, Script,
    ScriptedController,
};
