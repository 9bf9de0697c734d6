//! Service registry: the dependency-resolution contract and a small container.
//!
//! The unit-of-work components only ever talk to the [`Registry`] trait:
//! "is a component of this service type registered?", "resolve it", and
//! "resolve the component registered under this name". Any container can sit
//! behind it.
//!
//! [`ServiceRegistry`] is the in-process implementation used by the web
//! dispatcher and the tests. It supports typed and named registrations with
//! singleton or transient lifetimes.
//!
//! # Example
//!
//! ```
//! use scoped_uow_core::registry::{resolve_as, Lifetime, ServiceRegistry};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Clock;
//!
//! let registry = ServiceRegistry::new();
//! registry.register_instance(Arc::new(Clock)).unwrap();
//!
//! let clock: Arc<Clock> = resolve_as(&registry).unwrap();
//! # let _ = clock;
//! ```

use crate::error::BoxError;
use once_cell::sync::OnceCell;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// A resolved component: a type-erased value of the registered service type.
pub type Component = Arc<dyn Any + Send + Sync>;

/// Identity of a service type.
///
/// Equality and hashing use the [`TypeId`] only; the name is kept for
/// diagnostics and for deriving controller keys.
#[derive(Clone, Copy, Debug)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// Key for the service type `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The type identity.
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// The fully qualified type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ServiceKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceKey {}

impl Hash for ServiceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Errors raised while registering or resolving components.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No component is registered for the service type.
    #[error("service not registered: {service}")]
    NotRegistered {
        /// Requested service type.
        service: &'static str,
    },

    /// No component is registered under the name.
    #[error("no component registered under name '{name}'")]
    NamedNotRegistered {
        /// Requested name.
        name: String,
    },

    /// A component is already registered for the service type or name.
    #[error("service already registered: {service}")]
    AlreadyRegistered {
        /// Service type or name.
        service: String,
    },

    /// The resolved component is not of the requested type.
    #[error("component '{component}' is not a {expected}")]
    TypeMismatch {
        /// Type the caller asked for.
        expected: &'static str,
        /// Service type or name that was resolved.
        component: String,
    },

    /// A registered factory failed to build its component.
    #[error("factory for {service} failed")]
    Factory {
        /// Service type or name whose factory failed.
        service: String,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },
}

impl RegistryError {
    /// Wrap a factory failure for the given service.
    #[must_use]
    pub fn factory(
        service: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Factory {
            service: service.into(),
            source: Box::new(source),
        }
    }
}

/// The dependency-resolution contract consumed by injection and activation.
///
/// Implementations must support concurrent resolution from many requests.
pub trait Registry: Send + Sync {
    /// Whether a component of the service type is registered.
    fn has_component(&self, service: ServiceKey) -> bool;

    /// Resolve the component registered for the service type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotRegistered`] if nothing is registered, or the
    /// factory's failure.
    fn resolve(&self, service: ServiceKey) -> Result<Component, RegistryError>;

    /// Resolve the component registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NamedNotRegistered`] if nothing is registered
    /// under the name, or the factory's failure.
    fn resolve_named(&self, name: &str) -> Result<Component, RegistryError>;
}

/// Resolve a service by type and downcast it.
///
/// # Errors
///
/// Propagates resolution failures; returns [`RegistryError::TypeMismatch`] if
/// the registry hands back a component of another type.
pub fn resolve_as<T: Clone + 'static>(registry: &dyn Registry) -> Result<T, RegistryError> {
    let key = ServiceKey::of::<T>();
    let component = registry.resolve(key)?;
    downcast(&component, key.name())
}

/// Resolve a named component and downcast it.
///
/// # Errors
///
/// Propagates resolution failures; returns [`RegistryError::TypeMismatch`] if
/// the named component is not a `T`.
pub fn resolve_named_as<T: Clone + 'static>(
    registry: &dyn Registry,
    name: &str,
) -> Result<T, RegistryError> {
    let component = registry.resolve_named(name)?;
    downcast(&component, name)
}

fn downcast<T: Clone + 'static>(component: &Component, label: &str) -> Result<T, RegistryError> {
    component
        .downcast_ref::<T>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            component: label.to_string(),
        })
}

/// How long a resolved component lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifetime {
    /// Built once on first resolution and shared afterwards.
    Singleton,
    /// Built on every resolution.
    Transient,
}

type Factory = Arc<dyn Fn(&ServiceRegistry) -> Result<Component, RegistryError> + Send + Sync>;

struct Registration {
    label: String,
    lifetime: Lifetime,
    factory: Factory,
    instance: OnceCell<Component>,
}

impl Registration {
    fn component(&self, registry: &ServiceRegistry) -> Result<Component, RegistryError> {
        match self.lifetime {
            Lifetime::Singleton => self
                .instance
                .get_or_try_init(|| (self.factory)(registry))
                .map(Arc::clone),
            Lifetime::Transient => (self.factory)(registry),
        }
    }
}

/// In-process registry with typed and named registrations.
///
/// Factories run outside the internal locks, so a factory may resolve its own
/// dependencies from the registry it is given. Singleton construction happens
/// at most once even when first resolved from several threads at a time.
#[derive(Default)]
pub struct ServiceRegistry {
    by_type: RwLock<HashMap<TypeId, Arc<Registration>>>,
    by_name: RwLock<HashMap<String, Arc<Registration>>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing value as the singleton component for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `T` is already registered.
    pub fn register_instance<T>(&self, value: T) -> Result<(), RegistryError>
    where
        T: Send + Sync + 'static,
    {
        let component: Component = Arc::new(value);
        self.insert_typed::<T>(
            Lifetime::Singleton,
            Arc::new(move |_: &Self| Ok(Arc::clone(&component))),
        )
    }

    /// Register a lazily built singleton for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `T` is already registered.
    pub fn register_singleton<T, F>(&self, factory: F) -> Result<(), RegistryError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> Result<T, RegistryError> + Send + Sync + 'static,
    {
        self.insert_typed::<T>(Lifetime::Singleton, erase(factory))
    }

    /// Register a transient factory for `T`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if `T` is already registered.
    pub fn register_transient<T, F>(&self, factory: F) -> Result<(), RegistryError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> Result<T, RegistryError> + Send + Sync + 'static,
    {
        self.insert_typed::<T>(Lifetime::Transient, erase(factory))
    }

    /// Register a component under a name.
    ///
    /// Named components are only reachable through [`Registry::resolve_named`];
    /// they do not satisfy typed lookups.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the name is taken.
    pub fn register_named<T, F>(
        &self,
        name: impl Into<String>,
        lifetime: Lifetime,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        T: Send + Sync + 'static,
        F: Fn(&Self) -> Result<T, RegistryError> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut by_name = self.by_name.write().unwrap_or_else(PoisonError::into_inner);

        if by_name.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { service: name });
        }

        debug!(name = %name, ?lifetime, "Registered named component");
        by_name.insert(
            name.clone(),
            Arc::new(Registration {
                label: name,
                lifetime,
                factory: erase(factory),
                instance: OnceCell::new(),
            }),
        );
        Ok(())
    }

    /// Number of typed plus named registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        let typed = self.by_type.read().unwrap_or_else(PoisonError::into_inner).len();
        let named = self.by_name.read().unwrap_or_else(PoisonError::into_inner).len();
        typed + named
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_typed<T: 'static>(&self, lifetime: Lifetime, factory: Factory) -> Result<(), RegistryError> {
        let key = ServiceKey::of::<T>();
        let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);

        if by_type.contains_key(&key.id()) {
            return Err(RegistryError::AlreadyRegistered {
                service: key.name().to_string(),
            });
        }

        debug!(service = key.name(), ?lifetime, "Registered service");
        by_type.insert(
            key.id(),
            Arc::new(Registration {
                label: key.name().to_string(),
                lifetime,
                factory,
                instance: OnceCell::new(),
            }),
        );
        Ok(())
    }

    fn typed(&self, service: ServiceKey) -> Option<Arc<Registration>> {
        self.by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&service.id())
            .cloned()
    }

    fn named(&self, name: &str) -> Option<Arc<Registration>> {
        self.by_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

fn erase<T, F>(factory: F) -> Factory
where
    T: Send + Sync + 'static,
    F: Fn(&ServiceRegistry) -> Result<T, RegistryError> + Send + Sync + 'static,
{
    Arc::new(move |registry: &ServiceRegistry| {
        factory(registry).map(|value| Arc::new(value) as Component)
    })
}

impl Registry for ServiceRegistry {
    fn has_component(&self, service: ServiceKey) -> bool {
        self.by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&service.id())
    }

    fn resolve(&self, service: ServiceKey) -> Result<Component, RegistryError> {
        let registration = self.typed(service).ok_or(RegistryError::NotRegistered {
            service: service.name(),
        })?;
        registration.component(self)
    }

    fn resolve_named(&self, name: &str) -> Result<Component, RegistryError> {
        let registration = self
            .named(name)
            .ok_or_else(|| RegistryError::NamedNotRegistered {
                name: name.to_string(),
            })?;
        registration.component(self)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let typed: Vec<String> = self
            .by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|registration| registration.label.clone())
            .collect();
        let named: Vec<String> = self
            .by_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ServiceRegistry")
            .field("typed", &typed)
            .field("named", &named)
            .finish()
    }
}
