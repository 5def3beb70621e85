//! Task-pool tool group: the `task-action` multiplexer.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde::Deserialize;
use serde_json::Value;
use swarm_core::{short_id, CreateTask, Engine, EngineError, EngineResult};
use uuid::Uuid;

pub const TOOLS: &[&str] = &["task-action"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Action {
    Create,
    Claim,
    Release,
    Accept,
    Reject,
    ToBacklog,
    FromBacklog,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionArgs {
    action: Action,
    #[serde(default)]
    task_id: Option<Uuid>,
    #[serde(default)]
    reason: Option<String>,
    /// Remaining fields, used by `create`.
    #[serde(flatten)]
    rest: Value,
}

fn task_id(args: &ActionArgs) -> EngineResult<Uuid> {
    args.task_id
        .ok_or_else(|| EngineError::Validation("taskId is required for this action".into()))
}

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    if name != "task-action" {
        return Err(EngineError::NotFound("tool", name.to_string()));
    }
    let caller = ctx.require()?;
    let args: ActionArgs = parse_args(args)?;
    let tasks = engine.tasks();

    match args.action {
        Action::Create => {
            let mut request: CreateTask = parse_args(args.rest)?;
            request.creator_agent_id = request.creator_agent_id.or(Some(caller));
            let task = tasks.create(request).await?;
            Ok((
                format!("Task {} created ({}).", short_id(&task.id), task.status),
                to_value(&task)?,
            ))
        }
        Action::Claim => {
            let task = tasks.claim(task_id(&args)?, caller).await?;
            Ok((
                format!("Task {} is yours.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        Action::Release => {
            let task = tasks.release(task_id(&args)?, caller).await?;
            Ok((
                format!("Task {} returned to the pool.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        Action::Accept => {
            let task = tasks.accept(task_id(&args)?, caller).await?;
            Ok((
                format!("Offer accepted — task {} is yours.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        Action::Reject => {
            let task = tasks.reject(task_id(&args)?, caller, args.reason).await?;
            Ok((
                format!(
                    "Offer rejected — task {} returned to the pool.",
                    short_id(&task.id)
                ),
                to_value(&task)?,
            ))
        }
        Action::ToBacklog => {
            let task = tasks.to_backlog(task_id(&args)?, caller).await?;
            Ok((
                format!("Task {} parked in the backlog.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        Action::FromBacklog => {
            let task = tasks.from_backlog(task_id(&args)?, caller).await?;
            Ok((
                format!("Task {} back in the pool.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
    }
}
