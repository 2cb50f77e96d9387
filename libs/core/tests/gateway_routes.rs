use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use support_chat_core::{DeliveryCoordinator, GatewayConfig, GatewayState, InMemoryMessageStore, router};
use tower::ServiceExt;

fn app() -> Router {
    app_with(GatewayConfig::default())
}

fn app_with(config: GatewayConfig) -> Router {
    let coordinator = DeliveryCoordinator::new(InMemoryMessageStore::shared());
    router(GatewayState::new(coordinator, config))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create(app: &Router, id: &str) -> Value {
    let (status, body) = call(
        app,
        Method::POST,
        "/support/chats",
        Some(json!({"chat_id": id})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body
}

#[tokio::test]
async fn create_chat_posts_the_welcome_message() {
    let app = app();
    let summary = create(&app, "C1").await;
    assert_eq!(summary["chat_id"], "C1");
    assert_eq!(summary["status"], "new");
    assert_eq!(summary["message_count"], 1);

    let (status, page) = call(&app, Method::GET, "/support/chats/C1/messages", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["messages"][0]["sender"], "system");
    assert_eq!(page["messages"][0]["seq"], 1);

    let (status, body) = call(
        &app,
        Method::POST,
        "/support/chats",
        Some(json!({"chat_id": "C1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("C1"));
}

#[tokio::test]
async fn create_without_body_generates_an_id() {
    let app = app();
    let (status, summary) = call(&app, Method::POST, "/support/chats", None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!summary["chat_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn poll_returns_messages_after_marker() {
    let app = app_with(GatewayConfig {
        welcome_message: None,
        ..GatewayConfig::default()
    });
    create(&app, "C1").await;

    let (status, message) = call(
        &app,
        Method::POST,
        "/support/chats/C1/messages",
        Some(json!({"content": "hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["seq"], 1);
    assert_eq!(message["sender"], "user");
    assert_eq!(message["time_str"].as_str().unwrap().len(), 5);

    let (status, message) = call(
        &app,
        Method::POST,
        "/support/admin/chats/C1/messages",
        Some(json!({"content": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["sender"], "support");

    let (_, page) = call(&app, Method::GET, "/support/chats/C1/messages?since=1", None).await;
    let messages = page["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hello");

    let (_, page) = call(&app, Method::GET, "/support/chats/C1/messages?since=2", None).await;
    assert!(page["messages"].as_array().unwrap().is_empty());
    assert!(page.get("agent_name").is_none());
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let app = app();
    create(&app, "C1").await;

    let (status, body) = call(&app, Method::GET, "/support/chats/bad!id/messages", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, _) = call(&app, Method::GET, "/support/chats/C1/messages?since=soon", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/support/chats/C1/messages",
        Some(json!({"content": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/support/chats?status=closed", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_chat_is_not_found() {
    let app = app();
    for uri in ["/support/chats/ghost", "/support/chats/ghost/messages"] {
        let (status, body) = call(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }
}

#[tokio::test]
async fn assignment_is_exclusive_and_releasable() {
    let app = app();
    create(&app, "C1").await;

    let (status, summary) = call(
        &app,
        Method::POST,
        "/support/admin/chats/C1/assign",
        Some(json!({"agent": "Agent Smith"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["agent_name"], "Agent Smith");
    assert_eq!(summary["status"], "in_progress");

    let (status, _) = call(
        &app,
        Method::POST,
        "/support/admin/chats/C1/assign",
        Some(json!({"agent": "Agent Jones"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, page) = call(&app, Method::GET, "/support/chats/C1/messages", None).await;
    assert_eq!(page["agent_name"], "Agent Smith");

    let (status, summary) = call(&app, Method::POST, "/support/admin/chats/C1/release", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(summary["agent_name"].is_null());

    let (status, _) = call(
        &app,
        Method::POST,
        "/support/admin/chats/C1/assign",
        Some(json!({"agent": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn chat_list_filters_by_status() {
    let app = app();
    create(&app, "first").await;
    create(&app, "second").await;
    call(
        &app,
        Method::POST,
        "/support/chats/first/messages",
        Some(json!({"content": "help"})),
    )
    .await;

    let (status, all) = call(&app, Method::GET, "/support/chats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, queue) = call(&app, Method::GET, "/support/chats?status=new", None).await;
    let queue = queue.as_array().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0]["chat_id"], "second");
}

#[tokio::test]
async fn chat_list_filters_by_agent() {
    let app = app();
    for id in ["first", "second", "third"] {
        create(&app, id).await;
    }
    for (id, agent) in [("first", "Agent Smith"), ("second", "Agent Jones"), ("third", "Agent Smith")] {
        let (status, _) = call(
            &app,
            Method::POST,
            &format!("/support/admin/chats/{id}/assign"),
            Some(json!({"agent": agent})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    call(
        &app,
        Method::POST,
        "/support/admin/chats/first/messages",
        Some(json!({"content": "still here"})),
    )
    .await;

    let (status, history) = call(&app, Method::GET, "/support/chats?agent=Agent%20Smith", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|chat| chat["chat_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["first", "third"]);
}

#[tokio::test]
async fn availability_reports_config() {
    let (status, body) = call(&app(), Method::GET, "/support/availability", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"available": true}));

    let closed = app_with(GatewayConfig {
        available: false,
        ..GatewayConfig::default()
    });
    let (_, body) = call(&closed, Method::GET, "/support/availability", None).await;
    assert_eq!(body, json!({"available": false}));
}
