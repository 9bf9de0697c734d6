//! Dispatching HTTP requests through filters into controllers.
//!
//! A [`Dispatcher`] owns the global filter configuration plus the two
//! registry-backed collaborators: the filter provider and the controller
//! activator. Each request gets a freshly activated controller and freshly
//! injected filters, then runs through [`execute_action`].

use crate::error::AppError;
use crate::middleware::RequestId;
use axum::{
    Json,
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
    routing::{MethodFilter, MethodRouter, on},
};
use scoped_uow_core::{
    ActionContext, ActionDescriptor, ActionResult, ControllerActivator, FilterProvider,
    HttpConfiguration, Registry, RegistryControllerActivator, RegistryFilterProvider,
    execute_action,
};
use http_body_util::LengthLimitError;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Model-state key used when the request body is not valid JSON.
pub const BODY_KEY: &str = "body";

/// Dispatcher limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    body_limit: usize,
}

impl DispatcherConfig {
    /// Default request body limit (2 MiB).
    pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

    /// Config with the default body limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            body_limit: Self::DEFAULT_BODY_LIMIT,
        }
    }

    /// Set the largest accepted request body in bytes.
    #[must_use]
    pub const fn with_body_limit(mut self, body_limit: usize) -> Self {
        self.body_limit = body_limit;
        self
    }

    /// Largest accepted request body in bytes.
    #[must_use]
    pub const fn body_limit(&self) -> usize {
        self.body_limit
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs actions for HTTP requests.
///
/// Cheap to clone; clones share the configuration and collaborators.
#[derive(Clone)]
pub struct Dispatcher {
    configuration: Arc<HttpConfiguration>,
    filters: Arc<dyn FilterProvider>,
    activator: Arc<dyn ControllerActivator>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Dispatcher resolving filters and controllers from `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, configuration: HttpConfiguration) -> Self {
        Self {
            configuration: Arc::new(configuration),
            filters: Arc::new(RegistryFilterProvider::new(Arc::clone(&registry))),
            activator: Arc::new(RegistryControllerActivator::new(registry)),
            config: DispatcherConfig::default(),
        }
    }

    /// Replace the filter provider.
    #[must_use]
    pub fn with_filter_provider(mut self, filters: Arc<dyn FilterProvider>) -> Self {
        self.filters = filters;
        self
    }

    /// Replace the controller activator.
    #[must_use]
    pub fn with_activator(mut self, activator: Arc<dyn ControllerActivator>) -> Self {
        self.activator = activator;
        self
    }

    /// Replace the limits.
    #[must_use]
    pub const fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Global filter configuration.
    #[must_use]
    pub fn configuration(&self) -> &HttpConfiguration {
        &self.configuration
    }

    /// Run `action` for `request`.
    ///
    /// # Errors
    ///
    /// Returns an [`AppError`] if the body is too large, the controller or a
    /// filter cannot be built, or the action or one of its filters faults.
    pub async fn dispatch(
        &self,
        request: Request,
        action: &ActionDescriptor,
    ) -> Result<Response, AppError> {
        let (parts, body) = request.into_parts();
        let request_id = RequestId::from_extensions(&parts.extensions);
        let controller_name = action.controller().name();
        let span = tracing::info_span!(
            "action",
            request_id = %request_id,
            controller = %controller_name,
            action = %action.name(),
        );

        self.run(parts, body, action).instrument(span).await
    }

    async fn run(
        &self,
        parts: http::request::Parts,
        body: Body,
        action: &ActionDescriptor,
    ) -> Result<Response, AppError> {
        let controller_name = action.controller().name();
        let started = Instant::now();
        let bytes = read_body(body, self.config.body_limit).await?;

        let descriptor = action.controller();
        let controller = self.activator.activate(
            &parts,
            Some(descriptor),
            descriptor.controller_type(),
        )?;
        let filters = self
            .filters
            .collect_filters(Some(&self.configuration), Some(action))?;

        let mut context = ActionContext::new(controller_name, action.name(), parts);
        bind_arguments(&mut context, &bytes);

        let (_, outcome) = execute_action(&filters, controller.as_ref(), context)
            .await
            .into_parts();

        metrics::counter!(
            "dispatcher.actions",
            "controller" => controller_name.to_string(),
            "outcome" => if outcome.is_ok() { "ok" } else { "fault" }
        )
        .increment(1);

        let response = outcome.map(into_response).map_err(AppError::from);
        let status = match &response {
            Ok(response) => response.status(),
            Err(error) => error.status(),
        };
        tracing::debug!(
            status = status.as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Action dispatched"
        );
        response
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("configuration", &self.configuration)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn read_body(body: Body, limit: usize) -> Result<axum::body::Bytes, AppError> {
    axum::body::to_bytes(body, limit).await.map_err(|error| {
        tracing::debug!(limit, error = %error, "Rejected request body");
        let over_limit = std::error::Error::source(&error)
            .is_some_and(|inner| inner.is::<LengthLimitError>());
        let rejection = if over_limit {
            AppError::payload_too_large(limit)
        } else {
            AppError::bad_request("failed to read request body")
        };
        rejection.with_source(anyhow::Error::new(error))
    })
}

/// Bind a JSON body into the context's arguments.
///
/// An empty body binds nothing. A malformed body leaves the arguments unset
/// and records a model-state error under [`BODY_KEY`]; the action still runs
/// and decides what invalid input means.
pub fn bind_arguments(context: &mut ActionContext, body: &[u8]) {
    if body.is_empty() {
        return;
    }
    match serde_json::from_slice(body) {
        Ok(arguments) => context.set_arguments(arguments),
        Err(error) => context.model_state_mut().add_error(BODY_KEY, error.to_string()),
    }
}

/// HTTP response for an action result: JSON body, or status only when the body is `null`.
#[must_use]
pub fn into_response(result: ActionResult) -> Response {
    if result.body.is_null() {
        result.status.into_response()
    } else {
        (result.status, Json(result.body)).into_response()
    }
}

/// Route handler running `action` through `dispatcher`.
///
/// ```ignore
/// let orders = Arc::new(ControllerDescriptor::of::<OrdersController>("orders"));
/// let app = Router::new().route(
///     "/orders",
///     action_route(MethodFilter::POST, dispatcher, ActionDescriptor::new(orders, "create")),
/// );
/// ```
pub fn action_route<S>(
    method: MethodFilter,
    dispatcher: Dispatcher,
    action: ActionDescriptor,
) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    let action = Arc::new(action);
    on(method, move |request: Request| {
        let dispatcher = dispatcher.clone();
        let action = Arc::clone(&action);
        async move { dispatcher.dispatch(request, &action).await }
    })
}
