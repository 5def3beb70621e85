//! Core tool group: identity, task lifecycle, and the lead's inbox.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use crate::bridge::{notify_detached, BridgeNotifier};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use swarm_core::{
    short_id, CreateTask, DelegateOptions, Engine, EngineError, EngineResult, JoinRequest,
    TaskFilter, TaskStatus,
};
use uuid::Uuid;

pub const TOOLS: &[&str] = &[
    "join-swarm",
    "my-agent-info",
    "get-swarm",
    "get-tasks",
    "get-task-details",
    "send-task",
    "store-progress",
    "cancel-task",
    "poll-task",
    "get-inbox-message",
    "inbox-delegate",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskIdArgs {
    task_id: Uuid,
}

/// Progress report. `status` moves the task: `in_progress` starts it,
/// `completed` / `failed` finish it. Without a status this is a plain
/// progress snapshot.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressArgs {
    task_id: Uuid,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    status: Option<ReportedStatus>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReportedStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelArgs {
    task_id: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboxMessageArgs {
    inbox_message_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegateArgs {
    inbox_message_id: Uuid,
    agent_id: Uuid,
    #[serde(default)]
    task_description: Option<String>,
    #[serde(default)]
    offer_mode: bool,
    #[serde(default)]
    parent_task_id: Option<Uuid>,
}

pub async fn handle(
    engine: &Engine,
    bridge: &Arc<dyn BridgeNotifier>,
    name: &str,
    ctx: &ToolContext,
    args: serde_json::Value,
) -> EngineResult<ToolOutput> {
    match name {
        "join-swarm" => {
            let request: JoinRequest = parse_args(args)?;
            let agent = engine.agents().join(request).await?;
            let message = format!(
                "Welcome to the swarm, {}. Your agent id is {}.",
                agent.name, agent.id
            );
            Ok((message, to_value(&agent)?))
        }
        "my-agent-info" => {
            let caller = ctx.require()?;
            let registry = engine.agents();
            registry.touch(caller).await?;
            let agent = registry.get(caller).await?;
            let message = format!("You are {} ({}).", agent.name, agent.status);
            Ok((message, to_value(&agent)?))
        }
        "get-swarm" => {
            ctx.require()?;
            let agents = engine.agents().list().await?;
            let message = format!("{} agents in the swarm.", agents.len());
            Ok((message, json!({ "agents": agents })))
        }
        "get-tasks" => {
            ctx.require()?;
            let filter: TaskFilter = parse_args(args)?;
            let tasks = engine.tasks().list(filter).await?;
            let message = format!("{} tasks match.", tasks.len());
            Ok((message, json!({ "tasks": tasks })))
        }
        "get-task-details" => {
            ctx.require()?;
            let args: TaskIdArgs = parse_args(args)?;
            let task = engine.tasks().get(args.task_id).await?;
            let dependencies = engine.tasks().check_dependencies(args.task_id).await?;
            let history = engine.events().task_history(args.task_id).await?;
            let message = format!("Task {} is {}.", short_id(&task.id), task.status);
            Ok((
                message,
                json!({ "task": task, "dependencies": dependencies, "history": history }),
            ))
        }
        "send-task" => {
            let caller = ctx.require()?;
            let mut request: CreateTask = parse_args(args)?;
            request.creator_agent_id = request.creator_agent_id.or(Some(caller));
            let task = engine.tasks().create(request).await?;
            let message = match task.status {
                TaskStatus::Offered => format!(
                    "Task {} offered — awaiting accept/reject.",
                    short_id(&task.id)
                ),
                TaskStatus::Pending => format!("Task {} assigned.", short_id(&task.id)),
                _ => format!(
                    "Task {} added to the unassigned pool.",
                    short_id(&task.id)
                ),
            };
            Ok((message, to_value(&task)?))
        }
        "store-progress" => {
            let caller = ctx.require()?;
            let args: ProgressArgs = parse_args(args)?;
            let tasks = engine.tasks();
            match args.status {
                None => {
                    let progress = args.progress.ok_or_else(|| {
                        EngineError::Validation("progress text is required".into())
                    })?;
                    let task = tasks.update_progress(args.task_id, caller, progress).await?;
                    Ok((
                        format!("Progress recorded on {}.", short_id(&task.id)),
                        to_value(&task)?,
                    ))
                }
                Some(ReportedStatus::InProgress) => {
                    let task = tasks.start(args.task_id, caller).await?;
                    let task = match args.progress {
                        Some(progress) => {
                            tasks.update_progress(args.task_id, caller, progress).await?
                        }
                        None => task,
                    };
                    Ok((
                        format!("Task {} started.", short_id(&task.id)),
                        to_value(&task)?,
                    ))
                }
                Some(ReportedStatus::Completed) => {
                    let (task, followup) =
                        tasks.complete(args.task_id, caller, args.output).await?;
                    if task.external_context.is_some() {
                        notify_detached(bridge.clone(), task.clone());
                    }
                    Ok((
                        format!("Task {} completed.", short_id(&task.id)),
                        json!({ "task": task, "followupTask": followup }),
                    ))
                }
                Some(ReportedStatus::Failed) => {
                    let reason = args
                        .failure_reason
                        .or(args.progress)
                        .unwrap_or_else(|| "unspecified failure".to_string());
                    let (task, followup) = tasks.fail(args.task_id, caller, reason).await?;
                    if task.external_context.is_some() {
                        notify_detached(bridge.clone(), task.clone());
                    }
                    Ok((
                        format!("Task {} marked failed.", short_id(&task.id)),
                        json!({ "task": task, "followupTask": followup }),
                    ))
                }
            }
        }
        "cancel-task" => {
            let caller = ctx.require()?;
            let args: CancelArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let (task, _) = engine.tasks().cancel(args.task_id, &agent, args.reason).await?;
            Ok((
                format!("Task {} cancelled.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        "poll-task" => {
            let caller = ctx.require()?;
            let tasks = engine.tasks();
            let active = tasks
                .list(TaskFilter {
                    agent_id: Some(caller),
                    ..Default::default()
                })
                .await?;
            let active: Vec<_> = active
                .into_iter()
                .filter(|t| !t.status.is_terminal())
                .collect();
            let offered = tasks
                .list(TaskFilter {
                    offered_to: Some(caller),
                    status: Some(TaskStatus::Offered),
                    ..Default::default()
                })
                .await?;
            let message = format!(
                "{} active, {} offered to you.",
                active.len(),
                offered.len()
            );
            Ok((message, json!({ "active": active, "offered": offered })))
        }
        "get-inbox-message" => {
            let caller = ctx.require()?;
            let args: InboxMessageArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let message = engine.inbox().get(args.inbox_message_id, &agent).await?;
            Ok(("Inbox message retrieved.".to_string(), to_value(&message)?))
        }
        "inbox-delegate" => {
            let caller = ctx.require()?;
            let args: DelegateArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let (task, inbox_message) = engine
                .inbox()
                .delegate(
                    args.inbox_message_id,
                    &agent,
                    args.agent_id,
                    DelegateOptions {
                        task_description: args.task_description,
                        offer_mode: args.offer_mode,
                        parent_task_id: args.parent_task_id,
                    },
                )
                .await?;
            Ok((
                format!("Delegated as task {}.", short_id(&task.id)),
                json!({ "task": task, "inboxMessage": inbox_message }),
            ))
        }
        _ => Err(EngineError::NotFound("tool", name.to_string())),
    }
}
