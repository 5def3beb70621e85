//! Profile tool group.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde_json::Value;
use swarm_core::{Engine, EngineError, EngineResult, ProfileUpdate};

pub const TOOLS: &[&str] = &["update-profile"];

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    if name != "update-profile" {
        return Err(EngineError::NotFound("tool", name.to_string()));
    }
    let caller = ctx.require()?;
    let update: ProfileUpdate = parse_args(args)?;
    let agent = engine.agents().update_profile(caller, update).await?;
    Ok((
        format!("Profile updated for {}.", agent.name),
        to_value(&agent)?,
    ))
}
