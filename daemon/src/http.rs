//! HTTP surface: the tool-call transport plus read-only resource endpoints
//! for the dashboard. Writes identify the caller via the `X-Agent-ID`
//! header; reads are open.
use crate::tools::{ToolContext, ToolRegistry};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use swarm_core::{
    Engine, EngineError, EventFilter, InboxPush, MessageWindow, ServiceFilter, TaskFilter,
    TaskStatus,
};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub tools: Arc<ToolRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tools", get(list_tools))
        .route("/api/tools/:name", post(call_tool))
        .route("/api/inbox", post(push_inbox))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/:id/inbox-summary", get(inbox_summary))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/:id", get(task_details))
        .route("/api/channels", get(list_channels))
        .route("/api/channels/:id/messages", get(channel_messages))
        .route("/api/services", get(list_services))
        .route("/api/scheduled-tasks", get(list_schedules))
        .route("/api/epics", get(list_epics))
        .route("/api/epics/:id", get(epic_details))
        .route("/api/stats", get(stats))
        .route("/api/logs", get(logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// EngineError → HTTP status for the resource endpoints. Tool calls never
/// use this: their envelope carries the failure with a 200.
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_, _) => StatusCode::NOT_FOUND,
            EngineError::Unauthorized(_) => StatusCode::FORBIDDEN,
            EngineError::Conflict(_) | EngineError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.user_message() }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn caller_from(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("x-agent-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value.trim()).ok())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": VERSION }))
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.tools.tool_names() }))
}

async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Json<Value> {
    let ctx = ToolContext::new(caller_from(&headers));
    let args = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let response = state.tools.dispatch(&name, ctx, args).await;
    Json(serde_json::to_value(response).unwrap_or_else(|_| json!({ "success": false })))
}

async fn push_inbox(
    State(state): State<AppState>,
    Json(push): Json<InboxPush>,
) -> ApiResult {
    let message = state.engine.inbox().push(push).await?;
    Ok(Json(serde_json::to_value(message).map_err(EngineError::from)?))
}

async fn list_agents(State(state): State<AppState>) -> ApiResult {
    let agents = state.engine.agents().list().await?;
    Ok(Json(json!({ "agents": agents })))
}

async fn inbox_summary(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    // 404 for unknown agents rather than an all-zero summary.
    state.engine.agents().get(id).await?;
    let summary = state.engine.inbox().summary(id).await?;
    Ok(Json(serde_json::to_value(summary).map_err(EngineError::from)?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskQuery {
    status: Option<TaskStatus>,
    agent_id: Option<Uuid>,
    #[serde(default)]
    unassigned: bool,
    offered_to: Option<Uuid>,
    #[serde(default)]
    ready_only: bool,
    task_type: Option<String>,
    search: Option<String>,
    limit: Option<i64>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TaskQuery>,
) -> ApiResult {
    let tasks = state
        .engine
        .tasks()
        .list(TaskFilter {
            status: query.status,
            agent_id: query.agent_id,
            unassigned: query.unassigned,
            offered_to: query.offered_to,
            ready_only: query.ready_only,
            task_type: query.task_type,
            search: query.search,
            limit: query.limit,
            ..Default::default()
        })
        .await?;
    Ok(Json(json!({ "tasks": tasks })))
}

async fn task_details(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let task = state.engine.tasks().get(id).await?;
    let dependencies = state.engine.tasks().check_dependencies(id).await?;
    let history = state.engine.events().task_history(id).await?;
    Ok(Json(
        json!({ "task": task, "dependencies": dependencies, "history": history }),
    ))
}

async fn list_channels(State(state): State<AppState>) -> ApiResult {
    let channels = state.engine.channels().list_channels().await?;
    Ok(Json(json!({ "channels": channels })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageQuery {
    limit: Option<i64>,
    since: Option<DateTime<Utc>>,
    before: Option<DateTime<Utc>>,
}

async fn channel_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> ApiResult {
    let messages = state
        .engine
        .channels()
        .get_messages(
            id,
            MessageWindow {
                limit: query.limit,
                since: query.since,
                before: query.before,
            },
        )
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceQuery {
    status: Option<swarm_core::ServiceStatus>,
    name_prefix: Option<String>,
    agent_id: Option<Uuid>,
}

async fn list_services(
    State(state): State<AppState>,
    Query(query): Query<ServiceQuery>,
) -> ApiResult {
    let services = state
        .engine
        .services()
        .list(ServiceFilter {
            status: query.status,
            name_prefix: query.name_prefix,
            agent_id: query.agent_id,
            exclude_agent_id: None,
        })
        .await?;
    Ok(Json(json!({ "services": services })))
}

async fn list_schedules(State(state): State<AppState>) -> ApiResult {
    let schedules = state.engine.scheduler().list().await?;
    Ok(Json(json!({ "scheduledTasks": schedules })))
}

async fn list_epics(State(state): State<AppState>) -> ApiResult {
    let epics = state.engine.epics().list().await?;
    Ok(Json(json!({ "epics": epics })))
}

async fn epic_details(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult {
    let details = state.engine.epics().details(id).await?;
    Ok(Json(serde_json::to_value(details).map_err(EngineError::from)?))
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    let engine = &state.engine;
    let agents = engine.agents().list().await?;
    let tasks = engine.tasks().statistics().await?;
    let services = engine.services().list(ServiceFilter::default()).await?;
    let channels = engine.channels().list_channels().await?;
    let schedules = engine.scheduler().list().await?;
    let epics = engine.epics().list().await?;

    Ok(Json(json!({
        "agents": agents.len(),
        "tasks": { "total": tasks.total, "byStatus": tasks.by_status },
        "services": services.len(),
        "channels": channels.len(),
        "scheduledTasks": schedules.len(),
        "epics": epics.len(),
    })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogQuery {
    agent_id: Option<Uuid>,
    task_id: Option<Uuid>,
    event_type: Option<String>,
    limit: Option<i64>,
}

async fn logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> ApiResult {
    let events = state
        .engine
        .events()
        .list(EventFilter {
            agent_id: query.agent_id,
            task_id: query.task_id,
            event_type: query.event_type,
            limit: query.limit,
        })
        .await?;
    Ok(Json(json!({ "logs": events })))
}
