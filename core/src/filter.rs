//! Action filters and filter records.
//!
//! An [`ActionFilter`] runs around an action: `before_action` ahead of the
//! action body, `after_action` once it has produced an outcome. Filters are
//! registered as factories in a [`FilterCollection`] at global, controller, or
//! action scope; the host builds fresh instances for every dispatch, injects
//! their members, and executes them in scope order.

use crate::context::{ActionContext, ActionExecutedContext, ActionFault};
use crate::injection::Injectable;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by filter hooks.
pub type FilterFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ActionFault>> + Send + 'a>>;

/// Where a filter was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterScope {
    /// Applies to every action of the pipeline.
    Global,
    /// Applies to every action of one controller.
    Controller,
    /// Applies to a single action.
    Action,
}

impl FilterScope {
    /// Lowercase name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Controller => "controller",
            Self::Action => "action",
        }
    }
}

impl fmt::Display for FilterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-cutting logic invoked around an action.
///
/// Both hooks default to doing nothing.
///
/// # Dyn Compatibility
///
/// Hooks return boxed futures so filters can be stored as
/// `Box<dyn ActionFilter>`.
pub trait ActionFilter: Injectable {
    /// Runs before the action body.
    ///
    /// Returning an error skips the action and every filter after this one;
    /// the filters already entered observe the error in `after_action`.
    fn before_action<'a>(&'a self, context: &'a mut ActionContext) -> FilterFuture<'a> {
        let _ = context;
        Box::pin(std::future::ready(Ok(())))
    }

    /// Runs after the action body, or after an inner filter failed.
    ///
    /// Returning an error replaces the outcome seen by outer filters.
    fn after_action<'a>(&'a self, executed: &'a mut ActionExecutedContext) -> FilterFuture<'a> {
        let _ = executed;
        Box::pin(std::future::ready(Ok(())))
    }
}

/// A filter instance paired with the scope it came from.
pub struct FilterRecord {
    filter: Box<dyn ActionFilter>,
    scope: FilterScope,
}

impl FilterRecord {
    /// Pair a filter with its scope.
    #[must_use]
    pub fn new(filter: Box<dyn ActionFilter>, scope: FilterScope) -> Self {
        Self { filter, scope }
    }

    /// The filter instance.
    #[must_use]
    pub fn filter(&self) -> &dyn ActionFilter {
        self.filter.as_ref()
    }

    /// The filter instance, mutably (for injection).
    pub fn filter_mut(&mut self) -> &mut dyn ActionFilter {
        self.filter.as_mut()
    }

    /// Registration scope.
    #[must_use]
    pub const fn scope(&self) -> FilterScope {
        self.scope
    }
}

impl fmt::Debug for FilterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRecord")
            .field("filter", &self.filter.type_key().name())
            .field("scope", &self.scope)
            .finish()
    }
}

type FilterFactory = Arc<dyn Fn() -> Box<dyn ActionFilter> + Send + Sync>;

/// Ordered filter registrations for one scope.
///
/// Holds factories rather than instances: every dispatch gets its own filter
/// objects, so injected members never leak between requests.
#[derive(Clone, Default)]
pub struct FilterCollection {
    factories: Vec<FilterFactory>,
}

impl FilterCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter built by `factory`.
    pub fn add<F, T>(&mut self, factory: F) -> &mut Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: ActionFilter,
    {
        self.factories
            .push(Arc::new(move || Box::new(factory()) as Box<dyn ActionFilter>));
        self
    }

    /// Append a filter built with `T::default()`.
    pub fn add_default<T: ActionFilter + Default>(&mut self) -> &mut Self {
        self.add(T::default)
    }

    /// Builder form of [`FilterCollection::add`].
    #[must_use]
    pub fn with<F, T>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: ActionFilter,
    {
        self.add(factory);
        self
    }

    /// Build one instance of every filter, in registration order.
    pub fn instantiate(&self) -> impl Iterator<Item = Box<dyn ActionFilter>> + '_ {
        self.factories.iter().map(|factory| factory())
    }

    /// Number of registered filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether no filter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for FilterCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterCollection")
            .field("len", &self.factories.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static BUILT: AtomicUsize = AtomicUsize::new(0);

    #[derive(crate::Injectable, Default)]
    struct Noop;

    impl ActionFilter for Noop {}

    #[derive(crate::Injectable)]
    struct Tagged {
        #[inject(skip)]
        pub tag: &'static str,
    }

    impl ActionFilter for Tagged {}

    #[test]
    fn test_instantiate_builds_fresh_instances_in_order() {
        let mut filters = FilterCollection::new();
        filters.add(|| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Tagged { tag: "first" }
        });
        filters.add_default::<Noop>();

        let before = BUILT.load(Ordering::SeqCst);
        let first: Vec<_> = filters.instantiate().collect();
        let second: Vec<_> = filters.instantiate().collect();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(BUILT.load(Ordering::SeqCst) - before, 2);
        assert!(first[0].type_key().name().ends_with("Tagged"));
        assert!(first[1].type_key().name().ends_with("Noop"));
    }

    #[test]
    fn test_default_hooks_succeed() {
        let filter = Noop;
        let (parts, ()) = http::Request::new(()).into_parts();
        let mut context = ActionContext::new("c", "a", parts);

        tokio_test::block_on(filter.before_action(&mut context)).unwrap();

        let mut executed = ActionExecutedContext::new(context, Ok(crate::ActionResult::no_content()));
        tokio_test::block_on(filter.after_action(&mut executed)).unwrap();
    }

    #[test]
    fn test_record_debug_names_filter() {
        let record = FilterRecord::new(Box::new(Noop), FilterScope::Controller);
        let debug = format!("{record:?}");

        assert!(debug.contains("Noop"));
        assert!(debug.contains("Controller"));
        assert_eq!(record.scope().to_string(), "controller");
    }
}
