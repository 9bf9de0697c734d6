//! Property injection: member tables, the per-type member cache, and the injector.
//!
//! Filters are built by the host, not by the registry, so they cannot receive
//! their collaborators through a constructor. Instead each filter type
//! describes its public members ([`Injectable`], usually derived), and the
//! injector assigns every writable member whose service type the registry can
//! supply. Members whose service is not registered keep their current value.
//!
//! Member tables are computed once per concrete type and cached for the life
//! of the process in [`MemberCache::global`].
//!
//! # Example
//!
//! ```
//! use scoped_uow_core::injection::inject_members;
//! use scoped_uow_core::registry::ServiceRegistry;
//! use scoped_uow_core::Injectable;
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct AuditLog;
//!
//! #[derive(Injectable, Default)]
//! struct AuditFilter {
//!     pub audit: Option<Arc<AuditLog>>,
//! }
//!
//! let registry = ServiceRegistry::new();
//! registry.register_instance(Arc::new(AuditLog)).unwrap();
//!
//! let mut filter = AuditFilter::default();
//! inject_members(&registry, &mut filter).unwrap();
//! assert!(filter.audit.is_some());
//! ```

use crate::error::{Error, Result};
use crate::registry::{Component, Registry, ServiceKey};
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::trace;

/// One public member of an injectable type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberDescriptor {
    name: &'static str,
    service: ServiceKey,
    writable: bool,
}

impl MemberDescriptor {
    /// A member the injector may assign.
    #[must_use]
    pub const fn writable(name: &'static str, service: ServiceKey) -> Self {
        Self {
            name,
            service,
            writable: true,
        }
    }

    /// A public member that cannot be assigned.
    #[must_use]
    pub const fn read_only(name: &'static str, service: ServiceKey) -> Self {
        Self {
            name,
            service,
            writable: false,
        }
    }

    /// Member name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Declared service type.
    #[must_use]
    pub const fn service(&self) -> ServiceKey {
        self.service
    }

    /// Whether the member can be assigned.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }
}

/// Why a member assignment was refused.
#[derive(Error, Debug)]
pub enum AssignError {
    /// The type has no member with that name.
    #[error("no member named '{member}'")]
    UnknownMember {
        /// Requested member.
        member: String,
    },

    /// The member is public but not writable.
    #[error("member '{member}' is read-only")]
    ReadOnly {
        /// Requested member.
        member: &'static str,
    },

    /// The component is not of the member's declared type.
    #[error("member '{member}' expects a value of type {expected}")]
    TypeMismatch {
        /// Requested member.
        member: &'static str,
        /// Declared type of the member.
        expected: &'static str,
    },

    /// A hand-written setter rejected the value.
    #[error("member '{member}' rejected the value: {reason}")]
    Rejected {
        /// Requested member.
        member: String,
        /// Setter's explanation.
        reason: String,
    },
}

/// A type whose public members can be set from a [`Registry`].
///
/// Implement it with `#[derive(Injectable)]`; hand-written implementations
/// must keep `describe_members` stable for the lifetime of the process since
/// its result is cached per type.
pub trait Injectable: Send + Sync + 'static {
    /// Identity of the concrete type, used as the cache key.
    fn type_key(&self) -> ServiceKey {
        ServiceKey::of::<Self>()
    }

    /// Public members of the type in declaration order.
    fn describe_members(&self) -> Vec<MemberDescriptor>;

    /// Assign a resolved component to the named member.
    ///
    /// # Errors
    ///
    /// Returns an [`AssignError`] if the member is unknown, read-only, of
    /// another type, or refuses the value.
    fn assign_member(&mut self, member: &str, value: Component) -> std::result::Result<(), AssignError>;
}

static GLOBAL_CACHE: LazyLock<MemberCache> = LazyLock::new(MemberCache::new);

/// Per-type cache of writable member descriptors.
///
/// Population is keyed per type: concurrent first lookups of the same type
/// serialize on that key's shard only, and every caller observes the complete
/// table. Entries are never invalidated.
#[derive(Debug, Default)]
pub struct MemberCache {
    entries: DashMap<TypeId, Arc<[MemberDescriptor]>>,
}

impl MemberCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL_CACHE
    }

    /// Writable members of the target's concrete type.
    ///
    /// The first call for a type computes and stores the table; later calls
    /// return the stored table without asking the target again.
    pub fn members_of<T: Injectable + ?Sized>(&self, target: &T) -> Arc<[MemberDescriptor]> {
        let key = target.type_key();

        if let Some(found) = self.entries.get(&key.id()) {
            return Arc::clone(found.value());
        }

        let entry = self.entries.entry(key.id()).or_insert_with(|| {
            let members: Arc<[MemberDescriptor]> = target
                .describe_members()
                .into_iter()
                .filter(MemberDescriptor::is_writable)
                .collect();
            trace!(type_name = key.name(), members = members.len(), "Cached injectable members");
            metrics::counter!("member_cache.populated").increment(1);
            members
        });
        Arc::clone(entry.value())
    }

    /// Number of types cached so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no type has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Inject registry services into the target's writable members.
///
/// Uses the process-wide [`MemberCache`].
///
/// # Errors
///
/// - [`Error::Registry`] if a registered service fails to resolve
/// - [`Error::Configuration`] if a resolved service cannot be assigned; the
///   message names the member and the owning type
pub fn inject_members<T: Injectable + ?Sized>(registry: &dyn Registry, target: &mut T) -> Result<()> {
    inject_members_with(MemberCache::global(), registry, target)
}

/// Inject registry services into the target using a specific cache.
///
/// # Errors
///
/// See [`inject_members`].
pub fn inject_members_with<T: Injectable + ?Sized>(
    cache: &MemberCache,
    registry: &dyn Registry,
    target: &mut T,
) -> Result<()> {
    let owner = target.type_key();

    for member in cache.members_of(target).iter() {
        if !registry.has_component(member.service()) {
            trace!(
                type_name = owner.name(),
                member = member.name(),
                service = member.service().name(),
                "Service not registered, member left unchanged"
            );
            continue;
        }

        let value = registry.resolve(member.service())?;
        target.assign_member(member.name(), value).map_err(|source| {
            Error::configuration_with(
                format!("error setting member {} on type {}", member.name(), owner.name()),
                source,
            )
        })?;
        trace!(type_name = owner.name(), member = member.name(), "Injected member");
    }

    Ok(())
}

/// Inject registry services into every item.
///
/// Stops at the first failing item.
///
/// # Errors
///
/// See [`inject_members`].
pub fn inject_all<'a, T, I>(registry: &dyn Registry, items: I) -> Result<()>
where
    T: Injectable + ?Sized + 'a,
    I: IntoIterator<Item = &'a mut T>,
{
    for item in items {
        inject_members(registry, item)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::registry::{RegistryError, ServiceRegistry};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct ServiceX(&'static str);

    #[derive(Debug, PartialEq)]
    struct ServiceY(&'static str);

    #[derive(crate::Injectable)]
    struct Target {
        pub a: Option<Arc<ServiceX>>,
        pub b: Option<Arc<ServiceY>>,
        pub label: String,
        #[inject(skip)]
        pub skipped: Option<Arc<ServiceX>>,
        #[allow(dead_code)]
        hidden: Option<Arc<ServiceX>>,
    }

    impl Target {
        fn new() -> Self {
            Self {
                a: None,
                b: Some(Arc::new(ServiceY("original"))),
                label: "target".to_string(),
                skipped: None,
                hidden: None,
            }
        }
    }

    static DESCRIBE_CALLS: AtomicUsize = AtomicUsize::new(0);

    /// Hand-written implementation that counts how often it is described.
    struct Counted;

    impl Injectable for Counted {
        fn describe_members(&self) -> Vec<MemberDescriptor> {
            DESCRIBE_CALLS.fetch_add(1, Ordering::SeqCst);
            std::thread::yield_now();
            vec![
                MemberDescriptor::writable("value", ServiceKey::of::<Arc<ServiceX>>()),
                MemberDescriptor::read_only("id", ServiceKey::of::<u64>()),
            ]
        }

        fn assign_member(&mut self, member: &str, _value: Component) -> std::result::Result<(), AssignError> {
            Err(AssignError::UnknownMember {
                member: member.to_string(),
            })
        }
    }

    /// Setter that always refuses.
    struct Stubborn;

    impl Injectable for Stubborn {
        fn describe_members(&self) -> Vec<MemberDescriptor> {
            vec![MemberDescriptor::writable("x", ServiceKey::of::<Arc<ServiceX>>())]
        }

        fn assign_member(&mut self, member: &str, _value: Component) -> std::result::Result<(), AssignError> {
            Err(AssignError::Rejected {
                member: member.to_string(),
                reason: "frozen".to_string(),
            })
        }
    }

    #[test]
    fn test_cache_keeps_only_writable_members_in_order() {
        let cache = MemberCache::new();
        let members = cache.members_of(&Target::new());

        let names: Vec<_> = members.iter().map(MemberDescriptor::name).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(members[0].service(), ServiceKey::of::<Arc<ServiceX>>());
    }

    #[test]
    fn test_cache_returns_same_table() {
        let cache = MemberCache::new();
        let first = cache.members_of(&Target::new());
        let second = cache.members_of(&Target::new());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_first_lookups_compute_once() {
        let cache = MemberCache::new();
        let barrier = Barrier::new(16);
        let before = DESCRIBE_CALLS.load(Ordering::SeqCst);

        let tables: Vec<Arc<[MemberDescriptor]>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.members_of(&Counted)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(DESCRIBE_CALLS.load(Ordering::SeqCst) - before, 1);
        for table in &tables {
            assert!(Arc::ptr_eq(table, &tables[0]));
            assert_eq!(table.len(), 1);
            assert_eq!(table[0].name(), "value");
        }
    }

    #[test]
    fn test_injection_is_best_effort() {
        let registry = ServiceRegistry::new();
        let x = Arc::new(ServiceX("resolved"));
        registry.register_instance(Arc::clone(&x)).unwrap();

        let mut target = Target::new();
        inject_members_with(&MemberCache::new(), &registry, &mut target).unwrap();

        assert!(Arc::ptr_eq(target.a.as_ref().unwrap(), &x));
        assert_eq!(target.b.as_deref(), Some(&ServiceY("original")));
        assert!(target.skipped.is_none());
        assert!(target.hidden.is_none());
        assert_eq!(target.label, "target");
    }

    #[test]
    fn test_assignment_failure_names_member_and_type() {
        let registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(ServiceX("x"))).unwrap();

        let err = inject_members_with(&MemberCache::new(), &registry, &mut Stubborn).unwrap_err();

        let message = err.to_string();
        assert!(matches!(err, Error::Configuration { source: Some(_), .. }));
        assert!(message.contains("member x"));
        assert!(message.contains("Stubborn"));
    }

    #[test]
    fn test_resolution_failure_propagates() {
        let registry = ServiceRegistry::new();
        registry
            .register_transient::<Arc<ServiceX>, _>(|_| {
                Err(RegistryError::factory("x", std::io::Error::other("down")))
            })
            .unwrap();

        let err = inject_members(&registry, &mut Target::new()).unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::Factory { .. })));
    }

    #[test]
    fn test_inject_all_injects_every_item() {
        let registry = ServiceRegistry::new();
        let x = Arc::new(ServiceX("shared"));
        registry.register_instance(Arc::clone(&x)).unwrap();

        let mut items = vec![Target::new(), Target::new()];
        inject_all(&registry, items.iter_mut()).unwrap();

        for item in &items {
            assert!(Arc::ptr_eq(item.a.as_ref().unwrap(), &x));
            assert_eq!(item.b.as_deref(), Some(&ServiceY("original")));
        }
    }

    #[test]
    fn test_inject_all_through_trait_objects() {
        let registry = ServiceRegistry::new();
        registry.register_instance(Arc::new(ServiceX("shared"))).unwrap();

        let mut items: Vec<Box<dyn Injectable>> = vec![
            Box::new(Target::new()),
            Box::new(Stubborn),
        ];
        let err = inject_all(&registry, items.iter_mut().map(|item| &mut **item)).unwrap_err();

        assert!(err.to_string().contains("Stubborn"));
    }
}
