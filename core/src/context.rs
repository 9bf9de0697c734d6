//! Per-request action context.
//!
//! [`ActionContext`] is the request-scoped storage threaded through every
//! filter hook and the action itself. It carries the request head, the bound
//! arguments, the input-validation state, and the units of work opened for
//! this request, so nothing request-scoped lives in ambient or thread-local
//! state.

use crate::transaction::UnitsOfWork;
use http::StatusCode;
use http::request::Parts;
use serde::Serialize;
use std::collections::BTreeMap;

/// Failure raised by an action or a filter hook.
pub type ActionFault = anyhow::Error;

/// Input-validation state of an action's arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelState {
    errors: BTreeMap<String, Vec<String>>,
}

impl ModelState {
    /// Create a valid (empty) model state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a validation error for `key`.
    pub fn add_error(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.errors.entry(key.into()).or_default().push(message.into());
    }

    /// Whether no validation error was recorded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors recorded for `key`.
    #[must_use]
    pub fn errors_for(&self, key: &str) -> &[String] {
        self.errors.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// All errors, keyed by argument.
    #[must_use]
    pub const fn errors(&self) -> &BTreeMap<String, Vec<String>> {
        &self.errors
    }
}

/// Successful result of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    /// Response status.
    pub status: StatusCode,
    /// Response body; `Null` means no body.
    pub body: serde_json::Value,
}

impl ActionResult {
    /// 200 with a JSON body.
    #[must_use]
    pub const fn ok(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    /// 201 with a JSON body.
    #[must_use]
    pub const fn created(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            body,
        }
    }

    /// 204 without a body.
    #[must_use]
    pub const fn no_content() -> Self {
        Self {
            status: StatusCode::NO_CONTENT,
            body: serde_json::Value::Null,
        }
    }

    /// Serialize `value` as the body of a response with `status`.
    ///
    /// # Errors
    ///
    /// Returns the serialization error.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status,
            body: serde_json::to_value(value)?,
        })
    }
}

/// Everything an action execution can see about its request.
#[derive(Debug)]
pub struct ActionContext {
    controller: String,
    action: String,
    request: Parts,
    arguments: Option<serde_json::Value>,
    model_state: ModelState,
    units_of_work: UnitsOfWork,
}

impl ActionContext {
    /// Create a context for `controller`/`action` over the request head.
    #[must_use]
    pub fn new(controller: impl Into<String>, action: impl Into<String>, request: Parts) -> Self {
        Self {
            controller: controller.into(),
            action: action.into(),
            request,
            arguments: None,
            model_state: ModelState::new(),
            units_of_work: UnitsOfWork::default(),
        }
    }

    /// Controller name.
    #[must_use]
    pub fn controller(&self) -> &str {
        &self.controller
    }

    /// Action name.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Request head.
    #[must_use]
    pub const fn request(&self) -> &Parts {
        &self.request
    }

    /// Arguments bound from the request body, if any.
    #[must_use]
    pub const fn arguments(&self) -> Option<&serde_json::Value> {
        self.arguments.as_ref()
    }

    /// Replace the bound arguments.
    pub fn set_arguments(&mut self, arguments: serde_json::Value) {
        self.arguments = Some(arguments);
    }

    /// Input-validation state.
    #[must_use]
    pub const fn model_state(&self) -> &ModelState {
        &self.model_state
    }

    /// Mutable input-validation state.
    pub fn model_state_mut(&mut self) -> &mut ModelState {
        &mut self.model_state
    }

    /// Units of work opened for this request.
    #[must_use]
    pub const fn units_of_work(&self) -> &UnitsOfWork {
        &self.units_of_work
    }

    /// Mutable units of work opened for this request.
    pub fn units_of_work_mut(&mut self) -> &mut UnitsOfWork {
        &mut self.units_of_work
    }
}

/// Context handed to `after_action`: the action context plus its outcome.
#[derive(Debug)]
pub struct ActionExecutedContext {
    context: ActionContext,
    outcome: Result<ActionResult, ActionFault>,
}

impl ActionExecutedContext {
    /// Pair a context with the outcome of the code it wrapped.
    #[must_use]
    pub const fn new(context: ActionContext, outcome: Result<ActionResult, ActionFault>) -> Self {
        Self { context, outcome }
    }

    /// The action context.
    #[must_use]
    pub const fn context(&self) -> &ActionContext {
        &self.context
    }

    /// Mutable action context.
    pub fn context_mut(&mut self) -> &mut ActionContext {
        &mut self.context
    }

    /// The unhandled fault, if the wrapped code failed.
    #[must_use]
    pub fn fault(&self) -> Option<&ActionFault> {
        self.outcome.as_ref().err()
    }

    /// The result, if the wrapped code succeeded.
    #[must_use]
    pub fn result(&self) -> Option<&ActionResult> {
        self.outcome.as_ref().ok()
    }

    /// Replace the outcome, e.g. when an after-hook itself fails.
    pub fn set_outcome(&mut self, outcome: Result<ActionResult, ActionFault>) {
        self.outcome = outcome;
    }

    /// Split into context and outcome.
    #[must_use]
    pub fn into_parts(self) -> (ActionContext, Result<ActionResult, ActionFault>) {
        (self.context, self.outcome)
    }
}
