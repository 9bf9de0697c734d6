//! Pipeline, controller, and action descriptors.
//!
//! Each descriptor owns the filters registered at its scope.

use crate::filter::FilterCollection;
use crate::registry::ServiceKey;
use std::sync::Arc;

/// Pipeline-wide configuration: the global filters.
#[derive(Debug, Clone, Default)]
pub struct HttpConfiguration {
    filters: FilterCollection,
}

impl HttpConfiguration {
    /// Configuration without global filters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with the given global filters.
    #[must_use]
    pub const fn with_filters(filters: FilterCollection) -> Self {
        Self { filters }
    }

    /// Global filters.
    #[must_use]
    pub const fn filters(&self) -> &FilterCollection {
        &self.filters
    }

    /// Global filters, for registration.
    pub fn filters_mut(&mut self) -> &mut FilterCollection {
        &mut self.filters
    }
}

/// A controller as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct ControllerDescriptor {
    name: String,
    controller_type: ServiceKey,
    filters: FilterCollection,
}

impl ControllerDescriptor {
    /// Describe controller type `C` under a route name.
    #[must_use]
    pub fn of<C: 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controller_type: ServiceKey::of::<C>(),
            filters: FilterCollection::new(),
        }
    }

    /// Attach controller-scope filters.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterCollection) -> Self {
        self.filters = filters;
        self
    }

    /// Route name of the controller.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The controller's type.
    #[must_use]
    pub const fn controller_type(&self) -> ServiceKey {
        self.controller_type
    }

    /// Controller-scope filters.
    #[must_use]
    pub const fn filters(&self) -> &FilterCollection {
        &self.filters
    }

    /// Controller-scope filters, for registration.
    pub fn filters_mut(&mut self) -> &mut FilterCollection {
        &mut self.filters
    }
}

/// One action of a controller.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    name: String,
    controller: Arc<ControllerDescriptor>,
    filters: FilterCollection,
}

impl ActionDescriptor {
    /// Describe action `name` of `controller`.
    #[must_use]
    pub fn new(controller: Arc<ControllerDescriptor>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            controller,
            filters: FilterCollection::new(),
        }
    }

    /// Attach action-scope filters.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterCollection) -> Self {
        self.filters = filters;
        self
    }

    /// Action name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning controller.
    #[must_use]
    pub fn controller(&self) -> &ControllerDescriptor {
        &self.controller
    }

    /// Action-scope filters.
    #[must_use]
    pub const fn filters(&self) -> &FilterCollection {
        &self.filters
    }

    /// Action-scope filters, for registration.
    pub fn filters_mut(&mut self) -> &mut FilterCollection {
        &mut self.filters
    }
}
