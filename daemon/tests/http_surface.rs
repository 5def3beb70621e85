//! Read-surface tests: health, resource listings, and the HTTP tool
//! transport with its `X-Agent-ID` header contract.
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use swarm_core::{CapabilitySet, CreateTask, Engine, SqliteStore};
use swarm_daemon::bridge::LoggingBridge;
use swarm_daemon::http::{router, AppState};
use swarm_daemon::tools::ToolRegistry;
use tower::ServiceExt;

async fn app() -> (Engine, axum::Router) {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let engine = Engine::new(store);
    let tools = Arc::new(ToolRegistry::new(
        engine.clone(),
        CapabilitySet::all(),
        Arc::new(LoggingBridge),
    ));
    let router = router(AppState {
        engine: engine.clone(),
        tools,
    });
    (engine, router)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_status_and_version() {
    let (_, app) = app().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn tool_transport_reads_the_agent_header() {
    let (_, app) = app().await;

    // Without the header the uniform failure comes back with HTTP 200.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/tools/my-agent-info")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert!(body["message"].as_str().unwrap().contains("X-Agent-ID"));

    // Join, then call again with the header.
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/tools/join-swarm")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"w1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    let agent_id = body["data"]["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(
            Request::post("/api/tools/my-agent-info")
                .header("content-type", "application/json")
                .header("x-agent-id", &agent_id)
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["yourAgentId"], json!(agent_id));
    assert_eq!(body["data"]["name"], "w1");
}

#[tokio::test]
async fn task_listing_and_details() {
    let (engine, app) = app().await;
    let task = engine
        .tasks()
        .create(CreateTask::new("inspect me"))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::get("/api/tasks?status=unassigned")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/tasks/{}", task.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["task"]["task"], "inspect me");
    assert_eq!(body["dependencies"]["ready"], json!(true));
    assert_eq!(body["history"][0]["eventType"], "task_created");

    // Unknown ids are 404s, not empty objects.
    let response = app
        .oneshot(
            Request::get(format!("/api/tasks/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_logs_reflect_activity() {
    let (engine, app) = app().await;
    engine
        .tasks()
        .create(CreateTask::new("counted"))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["tasks"]["total"], json!(1));
    assert_eq!(body["tasks"]["byStatus"]["unassigned"], json!(1));
    assert_eq!(body["channels"], json!(1)); // seeded general

    let response = app
        .oneshot(
            Request::get("/api/logs?eventType=task_created")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["logs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn inbox_push_requires_a_lead() {
    let (engine, app) = app().await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/inbox")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"content":"hello?"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    engine
        .agents()
        .join(swarm_core::JoinRequest {
            name: "lead".to_string(),
            lead: true,
            ..Default::default()
        })
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::post("/api/inbox")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"content":"prod is down","slackChannelId":"C1"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["content"], "prod is down");
    assert_eq!(body["slackChannelId"], "C1");
}
