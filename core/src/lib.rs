//! # Scoped UoW Core
//!
//! Request-scoped units of work and registry-driven filter injection for an
//! HTTP action pipeline.
//!
//! ## Core Concepts
//!
//! - **Registry**: keyed service locator the pipeline resolves collaborators from
//! - **Injectable**: compile-time member table standing in for reflection
//! - **Member cache**: per-type memo of writable members, shared process-wide
//! - **Filter**: `before_action` / `after_action` hooks around an action
//! - **Filter provider**: global, controller, then action filters, each injected
//! - **Controller activator**: resolves controllers by a type-name key
//! - **Transaction filter**: begins a unit of work before the action and
//!   commits, rolls back, and always releases it afterwards
//!
//! ## Example
//!
//! ```ignore
//! use scoped_uow_core::*;
//!
//! let registry = Arc::new(ServiceRegistry::new());
//! registry.register_instance::<Arc<dyn SessionProvider>>(Arc::new(sessions))?;
//! registry.register_controller(|_| Ok(OrdersController))?;
//!
//! let mut configuration = HttpConfiguration::new();
//! configuration
//!     .filters_mut()
//!     .add(|| TransactionFilter::new().with_rollback_on_invalid_input(true));
//!
//! let orders = Arc::new(ControllerDescriptor::of::<OrdersController>("orders"));
//! let create = ActionDescriptor::new(orders, "create");
//!
//! let filters = RegistryFilterProvider::new(registry.clone())
//!     .collect_filters(Some(&configuration), Some(&create))?;
//! let executed = execute_action(&filters, controller.as_ref(), context).await;
//! ```

#![forbid(unsafe_code)]

// Lets `#[derive(Injectable)]` expand to `::scoped_uow_core::...` inside this crate.
extern crate self as scoped_uow_core;

pub use scoped_uow_macros::Injectable;

/// Action context, model state, and results.
pub mod context;

/// Controllers and controller activation.
pub mod controller;

/// Pipeline, controller, and action descriptors.
pub mod descriptor;

/// Crate-level error type.
pub mod error;

/// Action filter contract and filter collections.
pub mod filter;

/// Member descriptors, the member cache, and the member injector.
pub mod injection;

/// Action execution around filters.
pub mod pipeline;

/// Filter aggregation.
pub mod provider;

/// Registry contract and the in-process registry.
pub mod registry;

/// Units of work and the transaction filter.
pub mod transaction;

pub use context::{ActionContext, ActionExecutedContext, ActionFault, ActionResult, ModelState};
pub use controller::{
    ActionFuture, ControllerActivator, HttpController, RegistryControllerActivator, controller_key,
};
pub use descriptor::{ActionDescriptor, ControllerDescriptor, HttpConfiguration};
pub use error::{Error, Result};
pub use filter::{ActionFilter, FilterCollection, FilterFuture, FilterRecord, FilterScope};
pub use injection::{
    AssignError, Injectable, MemberCache, MemberDescriptor, inject_all, inject_members,
    inject_members_with,
};
pub use pipeline::execute_action;
pub use provider::{FilterProvider, RegistryFilterProvider};
pub use registry::{
    Component, Lifetime, Registry, RegistryError, ServiceKey, ServiceRegistry, resolve_as,
    resolve_named_as,
};
pub use transaction::{
    DEFAULT_SESSION_KEY, IsolationLevel, Outcome, ProcessDefaultKey, Session, SessionKeyProvider,
    SessionProvider, StoreFuture, Transaction, TransactionError, TransactionFilter, UnitOfWork,
    UnitsOfWork, default_session_key, set_default_session_key,
};
