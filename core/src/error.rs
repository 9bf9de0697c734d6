//! Crate-level error type.
//!
//! Failures are grouped the way callers have to react to them:
//!
//! - **Argument errors**: a required collaborator was not supplied at a public
//!   entry point. Raised before any side effect.
//! - **Configuration errors**: the registry or a descriptor is wired wrong, e.g.
//!   a resolved service could not be assigned to a filter member.
//! - **Registry / transaction errors**: propagated unchanged from the registry
//!   or the backing store so the root cause stays visible.

use crate::registry::RegistryError;
use crate::transaction::TransactionError;
use thiserror::Error;

/// Boxed error used as the source of configuration failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the unit-of-work and injection components.
#[derive(Error, Debug)]
pub enum Error {
    /// A required argument was absent at a public entry point.
    #[error("argument '{parameter}' must be provided")]
    MissingArgument {
        /// Name of the missing parameter.
        parameter: &'static str,
    },

    /// The registry, a descriptor, or a filter is misconfigured.
    #[error("{message}")]
    Configuration {
        /// Description including the member/type involved.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The registry could not supply a component.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The backing store failed to begin, commit, or roll back.
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl Error {
    /// Create an argument error for the named parameter.
    #[must_use]
    pub const fn missing(parameter: &'static str) -> Self {
        Self::MissingArgument { parameter }
    }

    /// Create a configuration error without an underlying cause.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error wrapping its cause.
    #[must_use]
    pub fn configuration_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
