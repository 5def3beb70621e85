//! Service tool group.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde::Deserialize;
use serde_json::{json, Value};
use swarm_core::{Engine, EngineError, EngineResult, ServiceFilter, ServiceStatus, UpsertService};
use uuid::Uuid;

pub const TOOLS: &[&str] = &[
    "register-service",
    "unregister-service",
    "list-services",
    "update-service-status",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterArgs {
    name: String,
    #[serde(flatten)]
    service: UpsertService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceIdArgs {
    service_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusArgs {
    service_id: Uuid,
    status: ServiceStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListArgs {
    #[serde(default)]
    status: Option<ServiceStatus>,
    #[serde(default)]
    name_prefix: Option<String>,
    #[serde(default)]
    agent_id: Option<Uuid>,
    #[serde(default = "default_include_own")]
    include_own: bool,
}

fn default_include_own() -> bool {
    true
}

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    let caller = ctx.require()?;
    let services = engine.services();

    match name {
        "register-service" => {
            let args: RegisterArgs = parse_args(args)?;
            let service = services.upsert(caller, &args.name, args.service).await?;
            Ok((
                format!("Service '{}' registered on port {}.", service.name, service.port),
                to_value(&service)?,
            ))
        }
        "unregister-service" => {
            let args: ServiceIdArgs = parse_args(args)?;
            services.unregister(args.service_id, caller).await?;
            Ok(("Service unregistered.".to_string(), Value::Null))
        }
        "list-services" => {
            let args: ListArgs = parse_args(args)?;
            let listed = services
                .list(ServiceFilter {
                    status: args.status,
                    name_prefix: args.name_prefix,
                    agent_id: args.agent_id,
                    exclude_agent_id: if args.include_own { None } else { Some(caller) },
                })
                .await?;
            Ok((
                format!("{} services.", listed.len()),
                json!({ "services": listed }),
            ))
        }
        "update-service-status" => {
            let args: StatusArgs = parse_args(args)?;
            let service = services.update_status(args.service_id, args.status).await?;
            Ok((
                format!("Service '{}' is {}.", service.name, service.status),
                to_value(&service)?,
            ))
        }
        _ => Err(EngineError::NotFound("tool", name.to_string())),
    }
}
