//! End-to-end dispatch tests: router → dispatcher → filters → controller.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    routing::MethodFilter,
};
use scoped_uow_core::{
    ActionContext, ActionDescriptor, ActionFuture, ActionResult, ControllerDescriptor,
    HttpConfiguration, HttpController, Registry, ServiceRegistry, SessionProvider,
    TransactionFilter,
};
use scoped_uow_testing::{RecordingSessionProvider, init_tracing};
use scoped_uow_web::{
    AppError, BODY_KEY, Dispatcher, DispatcherConfig, REQUEST_ID_HEADER, action_route,
    request_id_layer,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

/// Creates an order from `{"sku": ..., "quantity": ...}`.
struct OrdersController;

impl HttpController for OrdersController {
    fn invoke<'a>(&'a self, context: &'a mut ActionContext) -> ActionFuture<'a> {
        Box::pin(async move {
            let quantity = context
                .arguments()
                .and_then(|arguments| arguments["quantity"].as_i64())
                .unwrap_or_default();
            if quantity <= 0 {
                context
                    .model_state_mut()
                    .add_error("quantity", "must be positive");
            }
            if !context.model_state().is_valid() {
                return Err(AppError::invalid_model(context.model_state()).into());
            }

            let sku = context.arguments().map(|arguments| arguments["sku"].clone());
            match sku.as_ref().and_then(Value::as_str) {
                Some("sold-out") => Err(AppError::conflict("sku is sold out").into()),
                Some("crash") => Err(anyhow::anyhow!("warehouse unreachable")),
                _ => Ok(ActionResult::created(json!({ "sku": sku, "quantity": quantity }))),
            }
        })
    }
}

struct Fixture {
    sessions: RecordingSessionProvider,
    app: Router,
}

fn fixture(config: DispatcherConfig) -> Fixture {
    init_tracing();
    let sessions = RecordingSessionProvider::new();

    let registry = ServiceRegistry::new();
    registry
        .register_instance::<Arc<dyn SessionProvider>>(sessions.shared())
        .unwrap();
    registry
        .register_controller(|_| Ok(OrdersController))
        .unwrap();
    let registry: Arc<dyn Registry> = Arc::new(registry);

    let mut configuration = HttpConfiguration::new();
    configuration
        .filters_mut()
        .add(|| TransactionFilter::new().with_rollback_on_invalid_input(true));

    let dispatcher = Dispatcher::new(registry, configuration).with_config(config);
    let orders = Arc::new(ControllerDescriptor::of::<OrdersController>("orders"));

    let app = Router::new()
        .route(
            "/orders",
            action_route(
                MethodFilter::POST,
                dispatcher,
                ActionDescriptor::new(orders, "create"),
            ),
        )
        .layer(request_id_layer());

    Fixture { sessions, app }
}

async fn post(app: Router, body: &str) -> Response {
    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_valid_request_commits_and_returns_json() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());

    let response = post(app, r#"{"sku":"a-1","quantity":2}"#).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    assert_eq!(json_body(response).await, json!({ "sku": "a-1", "quantity": 2 }));
    assert_eq!(sessions.log().names(), vec!["begin", "commit", "dispose"]);
}

#[tokio::test]
async fn test_invalid_input_rolls_back_and_returns_details() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());

    let response = post(app, r#"{"sku":"a-1","quantity":0}"#).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["quantity"], json!(["must be positive"]));
    assert_eq!(sessions.log().names(), vec!["begin", "rollback", "dispose"]);
}

#[tokio::test]
async fn test_malformed_json_is_reported_under_body_key() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());

    let response = post(app, "{not json").await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert!(body["details"].get(BODY_KEY).is_some());
    assert_eq!(sessions.log().count("commit"), 0);
}

#[tokio::test]
async fn test_app_error_from_action_keeps_its_status() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());

    let response = post(app, r#"{"sku":"sold-out","quantity":1}"#).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["code"], "CONFLICT");
    assert_eq!(sessions.log().names(), vec!["begin", "rollback", "dispose"]);
}

#[tokio::test]
async fn test_unexpected_fault_is_masked_as_internal_error() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());

    let response = post(app, r#"{"sku":"crash","quantity":1}"#).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["code"], "INTERNAL_SERVER_ERROR");
    assert!(!body["message"].as_str().unwrap().contains("warehouse"));
    assert_eq!(sessions.log().count("rollback"), 1);
}

#[tokio::test]
async fn test_commit_failure_becomes_internal_error() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());
    sessions.fail_commit();

    let response = post(app, r#"{"sku":"a-1","quantity":1}"#).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(sessions.log().names(), vec!["begin", "commit", "dispose"]);
}

#[tokio::test]
async fn test_oversized_body_is_rejected_before_any_unit_of_work() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::new().with_body_limit(8));

    let response = post(app, r#"{"sku":"a-1","quantity":1}"#).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(sessions.log().calls().is_empty());
}

#[tokio::test]
async fn test_other_methods_are_not_routed() {
    let Fixture { sessions, app } = fixture(DispatcherConfig::default());
    let request = Request::builder()
        .method("GET")
        .uri("/orders")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert!(sessions.log().calls().is_empty());
}

#[tokio::test]
async fn test_unregistered_controller_is_internal_error() {
    init_tracing();
    let registry: Arc<dyn Registry> = Arc::new(ServiceRegistry::new());
    let dispatcher = Dispatcher::new(registry, HttpConfiguration::new());
    let orders = Arc::new(ControllerDescriptor::of::<OrdersController>("orders"));
    let request = Request::builder()
        .method("POST")
        .uri("/orders")
        .body(Body::empty())
        .unwrap();

    let error = dispatcher
        .dispatch(request, &ActionDescriptor::new(orders, "create"))
        .await
        .unwrap_err();

    assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
