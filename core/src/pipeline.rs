//! Action execution around filters.
//!
//! ```text
//! before(f1) -> before(f2) -> action -> after(f2) -> after(f1)
//! ```
//!
//! - Before-hooks run in order; the first failure skips the action and the
//!   remaining filters, and becomes the outcome.
//! - After-hooks run in reverse for every filter whose before-hook succeeded,
//!   including when the action or an inner filter failed.
//! - A failing after-hook replaces the outcome, so outer filters observe it.

use crate::context::{ActionContext, ActionExecutedContext};
use crate::controller::HttpController;
use crate::filter::FilterRecord;
use tracing::{debug, warn};

/// Run `controller`'s action inside `filters` (outermost first).
///
/// Never fails by itself: every fault ends up in the returned context's
/// outcome.
pub async fn execute_action(
    filters: &[FilterRecord],
    controller: &dyn HttpController,
    mut context: ActionContext,
) -> ActionExecutedContext {
    let mut entered = 0;
    let mut rejected = None;

    for record in filters {
        match record.filter().before_action(&mut context).await {
            Ok(()) => entered += 1,
            Err(fault) => {
                debug!(
                    filter = record.filter().type_key().name(),
                    scope = %record.scope(),
                    error = %fault,
                    "before_action failed, skipping action"
                );
                rejected = Some(fault);
                break;
            }
        }
    }

    let outcome = match rejected {
        Some(fault) => Err(fault),
        None => controller.invoke(&mut context).await,
    };

    let mut executed = ActionExecutedContext::new(context, outcome);

    for record in filters[..entered].iter().rev() {
        if let Err(fault) = record.filter().after_action(&mut executed).await {
            if let Some(previous) = executed.fault() {
                warn!(
                    filter = record.filter().type_key().name(),
                    previous = %previous,
                    error = %fault,
                    "after_action failed, replacing earlier fault"
                );
            } else {
                debug!(
                    filter = record.filter().type_key().name(),
                    error = %fault,
                    "after_action failed"
                );
            }
            executed.set_outcome(Err(fault));
        }
    }

    executed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::context::{ActionFault, ActionResult};
    use crate::controller::ActionFuture;
    use crate::filter::{ActionFilter, FilterFuture, FilterScope};
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(crate::Injectable)]
    struct Probe {
        name: &'static str,
        log: Log,
        fail_before: bool,
        fail_after: bool,
    }

    impl Probe {
        fn record(name: &'static str, log: &Log) -> FilterRecord {
            Self::failing(name, log, false, false)
        }

        fn failing(name: &'static str, log: &Log, fail_before: bool, fail_after: bool) -> FilterRecord {
            FilterRecord::new(
                Box::new(Self {
                    name,
                    log: Arc::clone(log),
                    fail_before,
                    fail_after,
                }),
                FilterScope::Global,
            )
        }
    }

    impl ActionFilter for Probe {
        fn before_action<'a>(&'a self, _context: &'a mut ActionContext) -> FilterFuture<'a> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            let result = if self.fail_before {
                Err(anyhow::anyhow!("{} rejected", self.name))
            } else {
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }

        fn after_action<'a>(&'a self, executed: &'a mut ActionExecutedContext) -> FilterFuture<'a> {
            let seen = executed
                .fault()
                .map_or_else(|| "ok".to_string(), ToString::to_string);
            self.log
                .lock()
                .unwrap()
                .push(format!("after:{}:{seen}", self.name));
            let result = if self.fail_after {
                Err(anyhow::anyhow!("{} failed", self.name))
            } else {
                Ok(())
            };
            Box::pin(std::future::ready(result))
        }
    }

    struct Action {
        log: Log,
        fault: Option<&'static str>,
    }

    impl HttpController for Action {
        fn invoke<'a>(&'a self, _context: &'a mut ActionContext) -> ActionFuture<'a> {
            self.log.lock().unwrap().push("action".to_string());
            let outcome: Result<ActionResult, ActionFault> = match self.fault {
                Some(message) => Err(anyhow::anyhow!(message)),
                None => Ok(ActionResult::no_content()),
            };
            Box::pin(std::future::ready(outcome))
        }
    }

    fn context() -> ActionContext {
        let (parts, ()) = http::Request::new(()).into_parts();
        ActionContext::new("orders", "create", parts)
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_hooks_wrap_action_in_reverse_order() {
        let log = Log::default();
        let filters = vec![Probe::record("outer", &log), Probe::record("inner", &log)];
        let action = Action {
            log: Arc::clone(&log),
            fault: None,
        };

        let executed = execute_action(&filters, &action, context()).await;

        assert!(executed.result().is_some());
        assert_eq!(
            entries(&log),
            vec!["before:outer", "before:inner", "action", "after:inner:ok", "after:outer:ok"]
        );
    }

    #[tokio::test]
    async fn test_action_fault_is_observed_by_every_filter() {
        let log = Log::default();
        let filters = vec![Probe::record("outer", &log), Probe::record("inner", &log)];
        let action = Action {
            log: Arc::clone(&log),
            fault: Some("boom"),
        };

        let executed = execute_action(&filters, &action, context()).await;

        assert_eq!(executed.fault().map(ToString::to_string).as_deref(), Some("boom"));
        assert_eq!(
            entries(&log)[3..],
            ["after:inner:boom".to_string(), "after:outer:boom".to_string()]
        );
    }

    #[tokio::test]
    async fn test_before_failure_skips_action_and_rejecting_filter() {
        let log = Log::default();
        let filters = vec![
            Probe::record("outer", &log),
            Probe::failing("guard", &log, true, false),
            Probe::record("inner", &log),
        ];
        let action = Action {
            log: Arc::clone(&log),
            fault: None,
        };

        let executed = execute_action(&filters, &action, context()).await;

        assert_eq!(
            executed.fault().map(ToString::to_string).as_deref(),
            Some("guard rejected")
        );
        assert_eq!(
            entries(&log),
            vec!["before:outer", "before:guard", "after:outer:guard rejected"]
        );
    }

    #[tokio::test]
    async fn test_after_failure_replaces_outcome_for_outer_filters() {
        let log = Log::default();
        let filters = vec![
            Probe::record("outer", &log),
            Probe::failing("inner", &log, false, true),
        ];
        let action = Action {
            log: Arc::clone(&log),
            fault: None,
        };

        let executed = execute_action(&filters, &action, context()).await;

        assert_eq!(
            executed.fault().map(ToString::to_string).as_deref(),
            Some("inner failed")
        );
        assert_eq!(entries(&log).last().map(String::as_str), Some("after:outer:inner failed"));
    }

    #[tokio::test]
    async fn test_without_filters_runs_action() {
        let log = Log::default();
        let action = Action {
            log: Arc::clone(&log),
            fault: None,
        };

        let executed = execute_action(&[], &action, context()).await;

        assert!(executed.fault().is_none());
        assert_eq!(entries(&log), vec!["action"]);
    }
}
