//! Scheduling tool group.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde::Deserialize;
use serde_json::{json, Value};
use swarm_core::{short_id, CreateSchedule, Engine, EngineError, EngineResult, UpdateSchedule};
use uuid::Uuid;

pub const TOOLS: &[&str] = &[
    "list-schedules",
    "create-schedule",
    "update-schedule",
    "delete-schedule",
    "run-schedule-now",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleIdArgs {
    schedule_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    schedule_id: Uuid,
    #[serde(flatten)]
    update: UpdateSchedule,
}

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    let caller = ctx.require()?;
    let scheduler = engine.scheduler();

    match name {
        "list-schedules" => {
            let schedules = scheduler.list().await?;
            Ok((
                format!("{} schedules.", schedules.len()),
                json!({ "schedules": schedules }),
            ))
        }
        "create-schedule" => {
            let mut request: CreateSchedule = parse_args(args)?;
            request.created_by_agent_id = request.created_by_agent_id.or(Some(caller));
            let schedule = scheduler.create(request).await?;
            Ok((
                format!("Schedule '{}' created.", schedule.name),
                to_value(&schedule)?,
            ))
        }
        "update-schedule" => {
            let args: UpdateArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let schedule = scheduler.update(args.schedule_id, &agent, args.update).await?;
            Ok((
                format!("Schedule '{}' updated.", schedule.name),
                to_value(&schedule)?,
            ))
        }
        "delete-schedule" => {
            let args: ScheduleIdArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            scheduler.delete(args.schedule_id, &agent).await?;
            Ok(("Schedule deleted.".to_string(), Value::Null))
        }
        "run-schedule-now" => {
            let args: ScheduleIdArgs = parse_args(args)?;
            let agent = engine.agents().get(caller).await?;
            let task = scheduler.run_now(args.schedule_id, &agent).await?;
            Ok((
                format!("Schedule fired — task {} created.", short_id(&task.id)),
                to_value(&task)?,
            ))
        }
        _ => Err(EngineError::NotFound("tool", name.to_string())),
    }
}
