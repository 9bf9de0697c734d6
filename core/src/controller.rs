//! Controllers and controller activation.
//!
//! Controllers are resolved from the registry under a key derived from their
//! type name, so the registry owns their construction (and any constructor
//! injection). No member injection is run on them.

use crate::context::{ActionContext, ActionFault, ActionResult};
use crate::descriptor::ControllerDescriptor;
use crate::error::{Error, Result};
use crate::registry::{Lifetime, Registry, RegistryError, ServiceKey, ServiceRegistry, resolve_named_as};
use http::request::Parts;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// Future returned by an action.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<ActionResult, ActionFault>> + Send + 'a>>;

/// A controller whose actions the pipeline can invoke.
pub trait HttpController: Send + Sync {
    /// Run the action named by `context.action()`.
    ///
    /// # Errors
    ///
    /// Any fault of the action; it is observed by the filters and surfaced.
    fn invoke<'a>(&'a self, context: &'a mut ActionContext) -> ActionFuture<'a>;
}

/// Registry key for a controller type: the lower-cased, fully qualified type name.
#[must_use]
pub fn controller_key(type_name: &str) -> String {
    type_name.to_lowercase()
}

/// Creates the controller instance for a request.
pub trait ControllerActivator: Send + Sync {
    /// Controller described by `descriptor` for this request.
    ///
    /// `controller_type` is what the host asked for; the registry activator
    /// resolves by the descriptor's type and only reports `controller_type`
    /// when the descriptor is missing.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if `descriptor` is absent
    /// - [`Error::Registry`] if the controller cannot be resolved
    fn activate(
        &self,
        request: &Parts,
        descriptor: Option<&ControllerDescriptor>,
        controller_type: ServiceKey,
    ) -> Result<Arc<dyn HttpController>>;
}

/// Activator resolving controllers by name from a registry.
#[derive(Clone)]
pub struct RegistryControllerActivator {
    registry: Arc<dyn Registry>,
}

impl RegistryControllerActivator {
    /// Activator resolving from `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

impl fmt::Debug for RegistryControllerActivator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryControllerActivator").finish_non_exhaustive()
    }
}

impl ControllerActivator for RegistryControllerActivator {
    fn activate(
        &self,
        _request: &Parts,
        descriptor: Option<&ControllerDescriptor>,
        controller_type: ServiceKey,
    ) -> Result<Arc<dyn HttpController>> {
        let descriptor = descriptor.ok_or_else(|| {
            Error::configuration(format!(
                "no controller descriptor supplied for {controller_type}"
            ))
        })?;

        let key = controller_key(descriptor.controller_type().name());
        debug!(controller = descriptor.name(), key = %key, "Activating controller");

        Ok(resolve_named_as::<Arc<dyn HttpController>>(self.registry.as_ref(), &key)?)
    }
}

impl ServiceRegistry {
    /// Register controller `C` as a transient component under
    /// [`controller_key`] of its type name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `C` is already registered.
    pub fn register_controller<C, F>(&self, factory: F) -> std::result::Result<(), RegistryError>
    where
        C: HttpController + 'static,
        F: Fn(&Self) -> std::result::Result<C, RegistryError> + Send + Sync + 'static,
    {
        self.register_named(
            controller_key(std::any::type_name::<C>()),
            Lifetime::Transient,
            move |registry: &Self| {
                factory(registry).map(|controller| Arc::new(controller) as Arc<dyn HttpController>)
            },
        )
    }
}
