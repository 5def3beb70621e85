//! End-to-end tests for the named-tool surface: envelope contract,
//! capability gating, and the offer/claim flows as agents exercise them.
use serde_json::{json, Value};
use std::sync::Arc;
use swarm_core::{CapabilitySet, Engine, SqliteStore};
use swarm_daemon::bridge::LoggingBridge;
use swarm_daemon::tools::{ToolContext, ToolRegistry, ToolResponse};
use uuid::Uuid;

async fn registry_with(capabilities: CapabilitySet) -> (Engine, ToolRegistry) {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let engine = Engine::new(store);
    let registry = ToolRegistry::new(engine.clone(), capabilities, Arc::new(LoggingBridge));
    (engine, registry)
}

async fn registry() -> ToolRegistry {
    registry_with(CapabilitySet::all()).await.1
}

async fn call(
    registry: &ToolRegistry,
    name: &str,
    caller: Option<Uuid>,
    args: Value,
) -> ToolResponse {
    registry.dispatch(name, ToolContext::new(caller), args).await
}

async fn join(registry: &ToolRegistry, name: &str, lead: bool, max_tasks: i64) -> Uuid {
    let response = call(
        registry,
        "join-swarm",
        None,
        json!({ "name": name, "lead": lead, "maxTasks": max_tasks }),
    )
    .await;
    assert!(response.success, "join failed: {}", response.message);
    Uuid::parse_str(response.data["id"].as_str().unwrap()).unwrap()
}

#[tokio::test]
async fn missing_caller_gets_the_uniform_failure() {
    let registry = registry().await;
    for tool in [
        "my-agent-info",
        "get-tasks",
        "send-task",
        "task-action",
        "post-message",
        "list-services",
        "list-schedules",
        "list-epics",
    ] {
        let response = call(&registry, tool, None, json!({})).await;
        assert!(!response.success, "{} should fail without a caller", tool);
        assert!(
            response.message.contains("X-Agent-ID"),
            "{} message was: {}",
            tool,
            response.message
        );
        assert!(response.your_agent_id.is_none());
    }
}

#[tokio::test]
async fn unknown_tools_are_reported_as_such() {
    let registry = registry().await;
    let caller = join(&registry, "w1", false, 1).await;
    let response = call(&registry, "paint-bikeshed", Some(caller), json!({})).await;
    assert!(!response.success);
    assert!(response.message.contains("not found"));
}

#[tokio::test]
async fn capability_gating_hides_whole_groups() {
    let (_, registry) = registry_with(CapabilitySet::parse("messaging")).await;
    let caller = join(&registry, "w1", false, 1).await;

    // Messaging is reachable.
    let response = call(&registry, "list-channels", Some(caller), json!({})).await;
    assert!(response.success);

    // Scheduling was not registered; indistinguishable from unknown.
    let response = call(&registry, "list-schedules", Some(caller), json!({})).await;
    assert!(!response.success);
    assert!(response.message.contains("not found"));

    let names = registry.tool_names();
    assert!(names.contains(&"post-message"));
    assert!(names.contains(&"join-swarm"));
    assert!(!names.contains(&"create-schedule"));
    assert!(!names.contains(&"task-action"));
}

#[tokio::test]
async fn envelope_carries_the_caller_id_and_camel_case_fields() {
    let registry = registry().await;
    let caller = join(&registry, "w1", false, 1).await;
    let response = call(&registry, "my-agent-info", Some(caller), json!({})).await;
    assert!(response.success);
    assert_eq!(response.your_agent_id, Some(caller));

    let wire = serde_json::to_value(&response).unwrap();
    assert!(wire.get("yourAgentId").is_some());
    assert!(wire.get("success").is_some());
    assert!(wire.get("message").is_some());
}

#[tokio::test]
async fn offer_reject_claim_flow_through_tools() {
    let registry = registry().await;
    let lead = join(&registry, "lead", true, 10).await;
    let w1 = join(&registry, "w1", false, 1).await;
    let w2 = join(&registry, "w2", false, 1).await;

    // send-task with offerMode targets w1.
    let response = call(
        &registry,
        "send-task",
        Some(lead),
        json!({ "task": "fix bug", "agentId": w1, "offerMode": true }),
    )
    .await;
    assert!(response.success);
    assert_eq!(response.data["status"], "offered");
    assert_eq!(response.data["offeredTo"], json!(w1));
    let task_id = response.data["id"].as_str().unwrap().to_string();

    // Only the target may reject.
    let response = call(
        &registry,
        "task-action",
        Some(w2),
        json!({ "action": "reject", "taskId": task_id, "reason": "not mine" }),
    )
    .await;
    assert!(!response.success);

    let response = call(
        &registry,
        "task-action",
        Some(w1),
        json!({ "action": "reject", "taskId": task_id, "reason": "no ctx" }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["status"], "unassigned");
    assert_eq!(response.data["rejectionReason"], "no ctx");

    // Back in the pool, w2 claims it.
    let response = call(
        &registry,
        "task-action",
        Some(w2),
        json!({ "action": "claim", "taskId": task_id }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["status"], "pending");
    assert_eq!(response.data["agentId"], json!(w2));
}

#[tokio::test]
async fn capacity_refusal_suggests_offer_mode() {
    let registry = registry().await;
    let lead = join(&registry, "lead", true, 10).await;
    let w1 = join(&registry, "w1", false, 1).await;

    let response = call(
        &registry,
        "send-task",
        Some(lead),
        json!({ "task": "first", "agentId": w1 }),
    )
    .await;
    assert!(response.success);

    let response = call(
        &registry,
        "send-task",
        Some(lead),
        json!({ "task": "second", "agentId": w1 }),
    )
    .await;
    assert!(!response.success);
    assert!(response.message.contains("offerMode"));

    let response = call(
        &registry,
        "send-task",
        Some(lead),
        json!({ "task": "second", "agentId": w1, "offerMode": true }),
    )
    .await;
    assert!(response.success);
}

#[tokio::test]
async fn store_progress_drives_the_execution_lifecycle() {
    let registry = registry().await;
    let lead = join(&registry, "lead", true, 10).await;
    let w1 = join(&registry, "w1", false, 1).await;

    let response = call(
        &registry,
        "send-task",
        Some(lead),
        json!({ "task": "run the migration", "agentId": w1 }),
    )
    .await;
    let task_id = response.data["id"].as_str().unwrap().to_string();

    let response = call(
        &registry,
        "store-progress",
        Some(w1),
        json!({ "taskId": task_id, "status": "in_progress", "progress": "booting" }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["status"], "in_progress");
    assert_eq!(response.data["progress"], "booting");

    let response = call(
        &registry,
        "store-progress",
        Some(w1),
        json!({ "taskId": task_id, "status": "completed", "output": "migrated 42 rows" }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["task"]["status"], "completed");
    assert_eq!(response.data["task"]["output"], "migrated 42 rows");
    // Worker outcome flows to the lead as a follow-up task.
    assert_eq!(response.data["followupTask"]["agentId"], json!(lead));

    // Terminal tasks reject further transitions.
    let response = call(
        &registry,
        "store-progress",
        Some(w1),
        json!({ "taskId": task_id, "status": "failed", "failureReason": "oops" }),
    )
    .await;
    assert!(!response.success);
}

#[tokio::test]
async fn mention_promotion_through_the_messaging_tools() {
    let registry = registry().await;
    let alice = join(&registry, "alice", false, 5).await;
    let w1 = join(&registry, "w1", false, 5).await;
    let w2 = join(&registry, "w2", false, 5).await;

    let response = call(&registry, "list-channels", Some(alice), json!({})).await;
    let general_id = response.data["channels"][0]["id"].as_str().unwrap().to_string();

    let response = call(
        &registry,
        "post-message",
        Some(alice),
        json!({
            "channelId": general_id,
            "content": "/task please review PR #12",
            "mentions": [w1, w2],
        }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    let created = response.data["createdTasks"].as_array().unwrap();
    assert_eq!(created.len(), 2);
    let content = response.data["message"]["content"].as_str().unwrap();
    assert!(content.starts_with("please review PR #12"));
    assert!(content.contains("→ Created: "));

    // Each worker finds their task via poll-task.
    let response = call(&registry, "poll-task", Some(w1), json!({})).await;
    assert!(response.success);
    assert_eq!(response.data["active"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn inbox_delegation_through_tools() {
    let (engine, registry) = registry_with(CapabilitySet::all()).await;
    let lead = join(&registry, "lead", true, 10).await;
    let w1 = join(&registry, "w1", false, 2).await;

    // The chat bridge writes inbox rows directly (over HTTP in production);
    // the tools read them back.
    let message = engine
        .inbox()
        .push(swarm_core::InboxPush {
            content: "prod is down, investigate".to_string(),
            slack_channel_id: Some("C9".to_string()),
            slack_thread_ts: Some("1722.33".to_string()),
            slack_user_id: Some("U1".to_string()),
        })
        .await
        .unwrap();

    // Workers cannot read the lead's inbox.
    let response = call(
        &registry,
        "get-inbox-message",
        Some(w1),
        json!({ "inboxMessageId": message.id }),
    )
    .await;
    assert!(!response.success);

    let response = call(
        &registry,
        "inbox-delegate",
        Some(lead),
        json!({ "inboxMessageId": message.id, "agentId": w1 }),
    )
    .await;
    assert!(response.success, "{}", response.message);
    assert_eq!(response.data["task"]["agentId"], json!(w1));
    assert_eq!(response.data["task"]["source"], "slack");
    assert_eq!(
        response.data["task"]["externalContext"]["channelId"],
        "C9"
    );
    assert_eq!(
        response.data["inboxMessage"]["delegatedTaskId"],
        response.data["task"]["id"]
    );
}
