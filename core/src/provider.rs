//! Filter aggregation.
//!
//! The pipeline asks a [`FilterProvider`] once per dispatch for the filters of
//! an action. [`RegistryFilterProvider`] concatenates global, controller, and
//! action filters (in that fixed order, each scope keeping its registration
//! order), builds fresh instances, and injects every instance from the
//! registry before handing them out.

use crate::descriptor::{ActionDescriptor, HttpConfiguration};
use crate::error::{Error, Result};
use crate::filter::{FilterRecord, FilterScope};
use crate::injection::inject_all;
use crate::registry::Registry;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Supplies the filters of one action dispatch.
pub trait FilterProvider: Send + Sync {
    /// Filters for `action` under `configuration`, outermost first.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingArgument`] if either argument is absent
    /// - injection failures, see [`inject_members`]
    fn collect_filters(
        &self,
        configuration: Option<&HttpConfiguration>,
        action: Option<&ActionDescriptor>,
    ) -> Result<Vec<FilterRecord>>;
}

/// Filter provider that property-injects filters from a registry.
#[derive(Clone)]
pub struct RegistryFilterProvider {
    registry: Arc<dyn Registry>,
}

impl RegistryFilterProvider {
    /// Provider injecting from `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

impl fmt::Debug for RegistryFilterProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryFilterProvider").finish_non_exhaustive()
    }
}

impl FilterProvider for RegistryFilterProvider {
    fn collect_filters(
        &self,
        configuration: Option<&HttpConfiguration>,
        action: Option<&ActionDescriptor>,
    ) -> Result<Vec<FilterRecord>> {
        let configuration = configuration.ok_or(Error::missing("configuration"))?;
        let action = action.ok_or(Error::missing("action_descriptor"))?;

        let sources = [
            (configuration.filters(), FilterScope::Global),
            (action.controller().filters(), FilterScope::Controller),
            (action.filters(), FilterScope::Action),
        ];

        let mut records: Vec<FilterRecord> = sources
            .into_iter()
            .flat_map(|(filters, scope)| {
                filters
                    .instantiate()
                    .map(move |filter| FilterRecord::new(filter, scope))
            })
            .collect();

        inject_all(
            self.registry.as_ref(),
            records.iter_mut().map(FilterRecord::filter_mut),
        )?;

        debug!(
            controller = action.controller().name(),
            action = action.name(),
            filters = records.len(),
            "Collected filters"
        );
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::ActionContext;
    use crate::descriptor::ControllerDescriptor;
    use crate::filter::{ActionFilter, FilterCollection, FilterFuture};
    use crate::registry::ServiceRegistry;
    use proptest::prelude::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AuditLog;

    type Seen = Arc<Mutex<Vec<(String, bool)>>>;

    #[derive(crate::Injectable)]
    struct Labelled {
        pub audit: Option<Arc<AuditLog>>,
        label: String,
        seen: Seen,
    }

    impl ActionFilter for Labelled {
        fn before_action<'a>(&'a self, _context: &'a mut ActionContext) -> FilterFuture<'a> {
            self.seen
                .lock()
                .unwrap()
                .push((self.label.clone(), self.audit.is_some()));
            Box::pin(std::future::ready(Ok(())))
        }
    }

    struct OrdersController;

    fn collection(prefix: &str, count: usize, seen: &Seen) -> FilterCollection {
        let mut filters = FilterCollection::new();
        for index in 1..=count {
            let label = format!("{prefix}{index}");
            let seen = Arc::clone(seen);
            filters.add(move || Labelled {
                audit: None,
                label: label.clone(),
                seen: Arc::clone(&seen),
            });
        }
        filters
    }

    fn descriptors(
        global: usize,
        controller: usize,
        action: usize,
        seen: &Seen,
    ) -> (HttpConfiguration, ActionDescriptor) {
        let configuration = HttpConfiguration::with_filters(collection("g", global, seen));
        let controller = Arc::new(
            ControllerDescriptor::of::<OrdersController>("orders")
                .with_filters(collection("c", controller, seen)),
        );
        let action = ActionDescriptor::new(controller, "create").with_filters(collection("a", action, seen));
        (configuration, action)
    }

    fn registry_with_audit() -> Arc<ServiceRegistry> {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register_instance(Arc::new(AuditLog)).unwrap();
        registry
    }

    fn run_before_hooks(records: &[FilterRecord]) {
        let (parts, ()) = http::Request::new(()).into_parts();
        let mut context = ActionContext::new("orders", "create", parts);
        for record in records {
            tokio_test::block_on(record.filter().before_action(&mut context)).unwrap();
        }
    }

    #[test]
    fn test_collects_global_then_controller_then_action() {
        let seen = Seen::default();
        let (configuration, action) = descriptors(2, 1, 2, &seen);
        let provider = RegistryFilterProvider::new(registry_with_audit());

        let records = provider
            .collect_filters(Some(&configuration), Some(&action))
            .unwrap();
        run_before_hooks(&records);

        let scopes: Vec<_> = records.iter().map(FilterRecord::scope).collect();
        assert_eq!(
            scopes,
            vec![
                FilterScope::Global,
                FilterScope::Global,
                FilterScope::Controller,
                FilterScope::Action,
                FilterScope::Action,
            ]
        );

        let seen = seen.lock().unwrap();
        let labels: Vec<_> = seen.iter().map(|(label, _)| label.as_str()).collect();
        assert_eq!(labels, vec!["g1", "g2", "c1", "a1", "a2"]);
        assert!(seen.iter().all(|(_, injected)| *injected));
    }

    #[test]
    fn test_unregistered_service_leaves_filters_uninjected() {
        let seen = Seen::default();
        let (configuration, action) = descriptors(1, 0, 1, &seen);
        let provider = RegistryFilterProvider::new(Arc::new(ServiceRegistry::new()));

        let records = provider
            .collect_filters(Some(&configuration), Some(&action))
            .unwrap();
        run_before_hooks(&records);

        assert!(seen.lock().unwrap().iter().all(|(_, injected)| !injected));
    }

    #[test]
    fn test_missing_arguments_fail_before_instantiation() {
        static BUILT: AtomicUsize = AtomicUsize::new(0);

        let mut global = FilterCollection::new();
        global.add(|| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Labelled {
                audit: None,
                label: String::new(),
                seen: Seen::default(),
            }
        });
        let configuration = HttpConfiguration::with_filters(global);
        let action = ActionDescriptor::new(
            Arc::new(ControllerDescriptor::of::<OrdersController>("orders")),
            "create",
        );
        let provider = RegistryFilterProvider::new(registry_with_audit());

        let no_configuration = provider.collect_filters(None, Some(&action)).unwrap_err();
        let no_action = provider.collect_filters(Some(&configuration), None).unwrap_err();

        assert!(matches!(
            no_configuration,
            Error::MissingArgument {
                parameter: "configuration"
            }
        ));
        assert!(matches!(
            no_action,
            Error::MissingArgument {
                parameter: "action_descriptor"
            }
        ));
        assert_eq!(BUILT.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_each_dispatch_gets_fresh_instances() {
        let seen = Seen::default();
        let (configuration, action) = descriptors(1, 1, 1, &seen);
        let provider = RegistryFilterProvider::new(registry_with_audit());

        let first = provider.collect_filters(Some(&configuration), Some(&action)).unwrap();
        let second = provider.collect_filters(Some(&configuration), Some(&action)).unwrap();

        for (a, b) in first.iter().zip(&second) {
            let a = std::ptr::from_ref(a.filter()).cast::<()>();
            let b = std::ptr::from_ref(b.filter()).cast::<()>();
            assert_ne!(a, b);
        }
    }

    proptest! {
        #[test]
        fn prop_scope_order_is_fixed(global in 0usize..4, controller in 0usize..4, action in 0usize..4) {
            let seen = Seen::default();
            let (configuration, descriptor) = descriptors(global, controller, action, &seen);
            let provider = RegistryFilterProvider::new(registry_with_audit());

            let records = provider.collect_filters(Some(&configuration), Some(&descriptor)).unwrap();
            run_before_hooks(&records);

            let expected: Vec<String> = (1..=global).map(|i| format!("g{i}"))
                .chain((1..=controller).map(|i| format!("c{i}")))
                .chain((1..=action).map(|i| format!("a{i}")))
                .collect();
            let labels: Vec<String> = seen.lock().unwrap().iter().map(|(label, _)| label.clone()).collect();

            prop_assert_eq!(records.len(), global + controller + action);
            prop_assert_eq!(labels, expected);
        }
    }
}
