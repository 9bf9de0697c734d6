//! Axum integration for scoped units of work.
//!
//! Maps routes onto controller actions and runs each request through the
//! filter pipeline from `scoped-uow-core`:
//!
//! 1. **Activate** a fresh controller from the registry
//! 2. **Collect** global, controller, and action filters, each injected
//! 3. **Bind** the JSON body into the action arguments
//! 4. **Execute** the action between the filters' hooks
//! 5. **Map** the result to JSON, or the fault to an [`AppError`]
//!
//! # Example
//!
//! ```ignore
//! use scoped_uow_web::{Dispatcher, action_route, request_id_layer};
//! use axum::{Router, routing::MethodFilter};
//!
//! let mut configuration = HttpConfiguration::new();
//! configuration.filters_mut().add_default::<TransactionFilter>();
//!
//! let dispatcher = Dispatcher::new(registry, configuration);
//! let orders = Arc::new(ControllerDescriptor::of::<OrdersController>("orders"));
//!
//! let app = Router::new()
//!     .route(
//!         "/orders",
//!         action_route(MethodFilter::POST, dispatcher, ActionDescriptor::new(orders, "create")),
//!     )
//!     .layer(request_id_layer());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatch;
pub mod error;
pub mod middleware;

pub use dispatch::{BODY_KEY, Dispatcher, DispatcherConfig, action_route, bind_arguments, into_response};
pub use error::AppError;
pub use middleware::{REQUEST_ID_HEADER, RequestId, request_id_layer};
