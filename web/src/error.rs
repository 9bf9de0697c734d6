//! HTTP error type for dispatched actions.
//!
//! [`AppError`] bridges action faults and HTTP responses. An `AppError`
//! raised inside an action travels through the pipeline as an
//! [`ActionFault`] and comes back out unchanged; any other fault becomes a
//! 500 whose cause is logged but never sent to the client.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use scoped_uow_core::{ActionFault, Error, ModelState};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Application error returned by dispatched actions.
///
/// # Examples
///
/// ```ignore
/// fn invoke<'a>(&'a self, context: &'a mut ActionContext) -> ActionFuture<'a> {
///     Box::pin(async move {
///         let order = find_order(context).await?
///             .ok_or_else(|| AppError::not_found("Order", id))?;
///         Ok(ActionResult::ok(serde_json::to_value(order)?))
///     })
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    /// User-facing message
    message: String,
    /// Stable code for client error handling
    code: String,
    /// Field errors, from model state
    details: BTreeMap<String, Vec<String>>,
    /// Internal cause (logged, not exposed to the client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: String) -> Self {
        Self {
            status,
            message,
            code,
            details: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach the internal cause.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "BAD_REQUEST".to_string())
    }

    /// Create a 404 Not Found error.
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            format!("{resource} with id {id} not found"),
            "NOT_FOUND".to_string(),
        )
    }

    /// Create a 409 Conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message.into(), "CONFLICT".to_string())
    }

    /// Create a 413 Payload Too Large error.
    #[must_use]
    pub fn payload_too_large(limit: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("request body exceeds {limit} bytes"),
            "PAYLOAD_TOO_LARGE".to_string(),
        )
    }

    /// Create a 422 Unprocessable Entity error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            message.into(),
            "VALIDATION_ERROR".to_string(),
        )
    }

    /// Create a 422 carrying every field error in `model_state`.
    #[must_use]
    pub fn invalid_model(model_state: &ModelState) -> Self {
        let mut error = Self::validation("request failed validation");
        error.details = model_state.errors().clone();
        error
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR".to_string(),
        )
    }

    /// HTTP status.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Error code.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Field errors, empty unless built from model state.
    #[must_use]
    pub const fn details(&self) -> &BTreeMap<String, Vec<String>> {
        &self.details
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    details: BTreeMap<String, Vec<String>>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    error = format!("{source:#}"),
                    "Action failed"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = %self.code,
                    message = %self.message,
                    "Action failed"
                ),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };

        (self.status, Json(body)).into_response()
    }
}

impl From<ActionFault> for AppError {
    fn from(fault: ActionFault) -> Self {
        match fault.downcast::<Self>() {
            Ok(error) => error,
            Err(fault) => {
                let message = match fault.downcast_ref::<Error>() {
                    Some(Error::Transaction(_)) => "The request could not be completed",
                    _ => "An internal error occurred",
                };
                Self::internal(message).with_source(fault)
            }
        }
    }
}

impl From<Error> for AppError {
    fn from(error: Error) -> Self {
        Self::from(ActionFault::from(error))
    }
}
