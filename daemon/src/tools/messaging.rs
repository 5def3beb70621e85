//! Messaging tool group.
use super::{parse_args, to_value, ToolContext, ToolOutput};
use serde::Deserialize;
use serde_json::{json, Value};
use swarm_core::{
    ChannelType, CreateChannel, Engine, EngineError, EngineResult, PostMessage,
    ReadMessagesOptions,
};
use uuid::Uuid;

pub const TOOLS: &[&str] = &[
    "list-channels",
    "create-channel",
    "post-message",
    "read-messages",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelArgs {
    name: String,
    #[serde(rename = "type", default)]
    channel_type: Option<ChannelType>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    participants: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageArgs {
    channel_id: Uuid,
    content: String,
    #[serde(default)]
    reply_to_id: Option<Uuid>,
    #[serde(default)]
    mentions: Vec<Uuid>,
}

pub async fn handle(
    engine: &Engine,
    name: &str,
    ctx: &ToolContext,
    args: Value,
) -> EngineResult<ToolOutput> {
    let caller = ctx.require()?;
    let hub = engine.channels();

    match name {
        "list-channels" => {
            let channels = hub.list_channels().await?;
            Ok((
                format!("{} channels.", channels.len()),
                json!({ "channels": channels }),
            ))
        }
        "create-channel" => {
            let args: CreateChannelArgs = parse_args(args)?;
            let channel = hub
                .create_channel(
                    &args.name,
                    CreateChannel {
                        channel_type: args.channel_type,
                        description: args.description,
                        created_by: Some(caller),
                        participants: args.participants,
                    },
                )
                .await?;
            Ok((
                format!("Channel #{} created.", channel.name),
                to_value(&channel)?,
            ))
        }
        "post-message" => {
            let args: PostMessageArgs = parse_args(args)?;
            let posted = hub
                .post_message(PostMessage {
                    channel_id: args.channel_id,
                    agent_id: Some(caller),
                    content: args.content,
                    reply_to_id: args.reply_to_id,
                    mentions: args.mentions,
                })
                .await?;
            let message = if posted.created_tasks.is_empty() {
                "Message posted.".to_string()
            } else {
                format!(
                    "Message posted; {} task(s) created from mentions.",
                    posted.created_tasks.len()
                )
            };
            Ok((message, to_value(&posted)?))
        }
        "read-messages" => {
            let options: ReadMessagesOptions = parse_args(args)?;
            let digest = hub.read_messages(caller, options).await?;
            Ok((
                format!("{} unread messages.", digest.len()),
                json!({ "messages": digest }),
            ))
        }
        _ => Err(EngineError::NotFound("tool", name.to_string())),
    }
}
