//! Named-tool dispatch.
//!
//! Every core operation is exposed as a named tool taking a JSON object and
//! returning a structured result plus a short human-readable message. The
//! transport (HTTP here, but nothing below this module cares) supplies the
//! caller's agent id from the `X-Agent-ID` header. Tool groups outside the
//! configured capability set are not registered at all.

mod core_tools;
mod epic_tools;
mod messaging;
mod profiles;
mod scheduling;
mod service_tools;
mod task_pool;

use crate::bridge::BridgeNotifier;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use swarm_core::{Capability, CapabilitySet, Engine, EngineError, EngineResult};
use uuid::Uuid;

pub const MISSING_CALLER: &str =
    "missing caller id — supply your agent id in the X-Agent-ID header";

/// Per-call context derived by the transport.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub caller: Option<Uuid>,
}

impl ToolContext {
    pub fn new(caller: Option<Uuid>) -> Self {
        Self { caller }
    }

    /// The caller's id, or the uniform missing-caller failure.
    pub fn require(&self) -> EngineResult<Uuid> {
        self.caller
            .ok_or_else(|| EngineError::Validation(MISSING_CALLER.to_string()))
    }
}

/// Uniform tool envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub success: bool,
    pub message: String,
    pub your_agent_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl ToolResponse {
    fn ok(caller: Option<Uuid>, message: String, data: Value) -> Self {
        Self {
            success: true,
            message,
            your_agent_id: caller,
            data,
        }
    }

    fn error(caller: Option<Uuid>, err: &EngineError) -> Self {
        Self {
            success: false,
            message: err.user_message(),
            your_agent_id: caller,
            data: Value::Null,
        }
    }
}

/// A successful handler result: the human-readable sentence plus the
/// structured payload.
pub(crate) type ToolOutput = (String, Value);

pub struct ToolRegistry {
    engine: Engine,
    capabilities: CapabilitySet,
    bridge: Arc<dyn BridgeNotifier>,
}

impl ToolRegistry {
    pub fn new(
        engine: Engine,
        capabilities: CapabilitySet,
        bridge: Arc<dyn BridgeNotifier>,
    ) -> Self {
        Self {
            engine,
            capabilities,
            bridge,
        }
    }

    /// Names of every registered tool, for discovery endpoints.
    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for capability in Capability::ALL {
            if !self.capabilities.contains(capability) {
                continue;
            }
            names.extend_from_slice(group_tools(capability));
        }
        names
    }

    pub async fn dispatch(&self, name: &str, ctx: ToolContext, args: Value) -> ToolResponse {
        match self.dispatch_inner(name, &ctx, args).await {
            Ok((message, data)) => ToolResponse::ok(ctx.caller, message, data),
            Err(err) => {
                if !err.is_caller_error() {
                    tracing::error!(tool = name, error = %err, "tool call failed");
                }
                ToolResponse::error(ctx.caller, &err)
            }
        }
    }

    async fn dispatch_inner(
        &self,
        name: &str,
        ctx: &ToolContext,
        args: Value,
    ) -> EngineResult<ToolOutput> {
        let Some(capability) = capability_of(name) else {
            return Err(EngineError::NotFound("tool", name.to_string()));
        };
        // Gated groups are simply absent, indistinguishable from unknown.
        if !self.capabilities.contains(capability) {
            return Err(EngineError::NotFound("tool", name.to_string()));
        }

        match capability {
            Capability::Core => {
                core_tools::handle(&self.engine, &self.bridge, name, ctx, args).await
            }
            Capability::TaskPool => task_pool::handle(&self.engine, name, ctx, args).await,
            Capability::Messaging => messaging::handle(&self.engine, name, ctx, args).await,
            Capability::Profiles => profiles::handle(&self.engine, name, ctx, args).await,
            Capability::Services => service_tools::handle(&self.engine, name, ctx, args).await,
            Capability::Scheduling => scheduling::handle(&self.engine, name, ctx, args).await,
            Capability::Epics => epic_tools::handle(&self.engine, name, ctx, args).await,
        }
    }
}

fn group_tools(capability: Capability) -> &'static [&'static str] {
    match capability {
        Capability::Core => core_tools::TOOLS,
        Capability::TaskPool => task_pool::TOOLS,
        Capability::Messaging => messaging::TOOLS,
        Capability::Profiles => profiles::TOOLS,
        Capability::Services => service_tools::TOOLS,
        Capability::Scheduling => scheduling::TOOLS,
        Capability::Epics => epic_tools::TOOLS,
    }
}

fn capability_of(name: &str) -> Option<Capability> {
    Capability::ALL
        .into_iter()
        .find(|capability| group_tools(*capability).contains(&name))
}

/// Deserialize tool arguments, surfacing serde's complaint as a validation
/// failure the caller can act on. Absent arguments read as `{}`.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> EngineResult<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| EngineError::Validation(format!("invalid arguments: {}", e)))
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> EngineResult<Value> {
    Ok(serde_json::to_value(value)?)
}
