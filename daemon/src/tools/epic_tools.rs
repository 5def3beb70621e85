//! Epic tool group.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde::Deserialize;
use serde_json::{json, Value};
use swarm_core::{CreateEpic, Engine, EngineError, EngineResult, UpdateEpic};
use uuid::Uuid;

pub const TOOLS: &[&str] = &[
    "create-epic",
    "list-epics",
    "get-epic-details",
    "update-epic",
    "delete-epic",
    "assign-task-to-epic",
    "unassign-task-from-epic",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpicIdArgs {
    epic_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    epic_id: Uuid,
    #[serde(flatten)]
    update: UpdateEpic,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssignArgs {
    epic_id: Uuid,
    task_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnassignArgs {
    task_id: Uuid,
}

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    let caller = ctx.require()?;
    let epics = engine.epics();

    match name {
        "create-epic" => {
            let mut request: CreateEpic = parse_args(args)?;
            request.created_by_agent_id = request.created_by_agent_id.or(Some(caller));
            let epic = epics.create(request).await?;
            Ok((format!("Epic '{}' created.", epic.name), to_value(&epic)?))
        }
        "list-epics" => {
            let listed = epics.list().await?;
            Ok((
                format!("{} epics.", listed.len()),
                json!({ "epics": listed }),
            ))
        }
        "get-epic-details" => {
            let args: EpicIdArgs = parse_args(args)?;
            let details = epics.details(args.epic_id).await?;
            let message = format!(
                "Epic '{}': {}/{} tasks completed.",
                details.epic.name, details.progress.completed, details.progress.total
            );
            Ok((message, to_value(&details)?))
        }
        "update-epic" => {
            let args: UpdateArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let epic = epics.update(args.epic_id, &agent, args.update).await?;
            Ok((format!("Epic '{}' updated.", epic.name), to_value(&epic)?))
        }
        "delete-epic" => {
            let args: EpicIdArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            epics.delete(args.epic_id, &agent).await?;
            Ok(("Epic deleted; its tasks were detached.".to_string(), Value::Null))
        }
        "assign-task-to-epic" => {
            let args: AssignArgs = parse_args(args)?;
            let task = epics.assign_task(args.epic_id, args.task_id).await?;
            Ok(("Task assigned to epic.".to_string(), to_value(&task)?))
        }
        "unassign-task-from-epic" => {
            let args: UnassignArgs = parse_args(args)?;
            let task = epics.unassign_task(args.task_id).await?;
            Ok(("Task detached from its epic.".to_string(), to_value(&task)?))
        }
        _ => Err(EngineError::NotFound("tool", name.to_string())),
    }
}
