/// Channel hub: channels, messages, threading, mentions, read-state, and
/// the `/task` message-to-task promoter.
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, EventKind, NewEvent};
use crate::model::{
    encode_list, short_id, truncate, Channel, ChannelMessage, ChannelType, Task, TaskSource,
};
use crate::store::{new_id, SqliteStore};
use crate::tasks::{self, CreateTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Literal prefix that turns a message into tasks for its mentions.
const TASK_COMMAND_PREFIX: &str = "/task ";

const MESSAGE_COLUMNS: &str =
    "id, channel_id, agent_id, content, reply_to_id, mentions, created_at";

/// Parameters for creating a channel.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannel {
    #[serde(default)]
    pub channel_type: Option<ChannelType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_by: Option<Uuid>,
    #[serde(default)]
    pub participants: Vec<Uuid>,
}

/// Parameters for posting a message. `agent_id = None` posts as "Human".
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessage {
    pub channel_id: Uuid,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    pub content: String,
    #[serde(default)]
    pub reply_to_id: Option<Uuid>,
    #[serde(default)]
    pub mentions: Vec<Uuid>,
}

/// A stored message plus any tasks the `/task` prefix produced.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostedMessage {
    pub message: ChannelMessage,
    pub created_tasks: Vec<Task>,
}

/// Pagination window for message reads.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageWindow {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub before: Option<DateTime<Utc>>,
}

/// A message annotated for digest views: author name plus channel name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotatedMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub channel_name: String,
    pub agent_name: String,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub mentions: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Options for the cross-channel unread digest.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessagesOptions {
    #[serde(default)]
    pub channel_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<i64>,
    /// Mark each visited channel read as a side effect.
    #[serde(default)]
    pub mark_read: bool,
}

/// Options for the mention listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionQuery {
    #[serde(default)]
    pub unread_only: bool,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
}

pub struct ChannelHub {
    store: SqliteStore,
}

impl ChannelHub {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub async fn list_channels(&self) -> EngineResult<Vec<Channel>> {
        let rows = sqlx::query(
            "SELECT id, name, description, channel_type, created_by, participants, created_at \
             FROM channels ORDER BY created_at ASC",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| Channel::from_row(row).map_err(Into::into))
            .collect()
    }

    pub async fn get_channel(&self, id: Uuid) -> EngineResult<Channel> {
        let row = sqlx::query(
            "SELECT id, name, description, channel_type, created_by, participants, created_at \
             FROM channels WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(Channel::from_row(&row)?),
            None => Err(EngineError::NotFound("channel", id.to_string())),
        }
    }

    pub async fn create_channel(
        &self,
        name: &str,
        options: CreateChannel,
    ) -> EngineResult<Channel> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("channel name is required".into()));
        }

        let taken: Option<String> = sqlx::query_scalar("SELECT id FROM channels WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.store.pool())
            .await?;
        if taken.is_some() {
            return Err(EngineError::Conflict(format!(
                "a channel named '{}' already exists",
                name
            )));
        }

        let channel_type = options.channel_type.unwrap_or(ChannelType::Public);
        if channel_type == ChannelType::Dm && options.participants.len() < 2 {
            return Err(EngineError::Validation(
                "a dm channel needs at least two participants".into(),
            ));
        }

        let row = sqlx::query(
            "INSERT INTO channels (id, name, description, channel_type, created_by, participants, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             RETURNING id, name, description, channel_type, created_by, participants, created_at",
        )
        .bind(new_id().to_string())
        .bind(name)
        .bind(&options.description)
        .bind(channel_type.to_string())
        .bind(options.created_by.map(|v| v.to_string()))
        .bind(encode_list(&options.participants)?)
        .bind(Utc::now())
        .fetch_one(self.store.pool())
        .await?;
        Ok(Channel::from_row(&row)?)
    }

    /// Post a message. When the content starts with `/task ` (after leading
    /// whitespace), the prefix is stripped and one direct-assigned task is
    /// created per unique resolved mention, all in the same transaction;
    /// the stored body is then rewritten to link the created tasks.
    pub async fn post_message(&self, request: PostMessage) -> EngineResult<PostedMessage> {
        if request.content.trim().is_empty() {
            return Err(EngineError::Validation("message content is required".into()));
        }

        let mut tx = self.store.begin().await?;

        let channel_name: Option<String> =
            sqlx::query_scalar("SELECT name FROM channels WHERE id = ?1")
                .bind(request.channel_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(channel_name) = channel_name else {
            return Err(EngineError::NotFound(
                "channel",
                request.channel_id.to_string(),
            ));
        };

        let sender_name = match request.agent_id {
            Some(agent_id) => tasks::fetch_agent(&mut tx, agent_id).await?.name,
            None => "Human".to_string(),
        };

        // Thread follow-up inference: a reply without explicit mentions
        // inherits the parent's, for notification only.
        let explicit_mentions = dedupe(&request.mentions);
        let mut mentions = explicit_mentions.clone();
        if let Some(parent_id) = request.reply_to_id {
            let parent = fetch_message(&mut tx, parent_id).await?;
            if parent.channel_id != request.channel_id {
                return Err(EngineError::Validation(
                    "reply target is in a different channel".into(),
                ));
            }
            if mentions.is_empty() {
                mentions = parent.mentions.clone();
            }
        }

        let (is_task_command, body) = strip_task_prefix(&request.content);

        let message_id = new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO channel_messages (id, channel_id, agent_id, content, reply_to_id, mentions, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(message_id.to_string())
        .bind(request.channel_id.to_string())
        .bind(request.agent_id.map(|v| v.to_string()))
        .bind(&body)
        .bind(request.reply_to_id.map(|v| v.to_string()))
        .bind(encode_list(&mentions)?)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // Only the /task prefix creates tasks, and only from mentions the
        // author supplied themselves; inherited mentions never do.
        let mut created_tasks = Vec::new();
        if is_task_command {
            let source = if request.agent_id.is_some() {
                TaskSource::Mcp
            } else {
                TaskSource::Api
            };
            for target in &explicit_mentions {
                let resolved: Option<String> =
                    sqlx::query_scalar("SELECT name FROM agents WHERE id = ?1")
                        .bind(target.to_string())
                        .fetch_optional(&mut *tx)
                        .await?;
                if resolved.is_none() {
                    continue;
                }
                let description = format!(
                    "{} in #{}: {}",
                    sender_name,
                    channel_name,
                    truncate(&body, 80)
                );
                let task = tasks::create_in_conn(
                    &mut tx,
                    CreateTask {
                        source: Some(source),
                        agent_id: Some(*target),
                        creator_agent_id: request.agent_id,
                        ..CreateTask::new(description)
                    },
                    false,
                )
                .await?;
                created_tasks.push(task);
            }
        }

        let final_body = if created_tasks.is_empty() {
            body
        } else {
            let links: Vec<String> = created_tasks.iter().map(|t| short_id(&t.id)).collect();
            let rewritten = format!("{}\n\n→ Created: {}", body, links.join(" "));
            sqlx::query("UPDATE channel_messages SET content = ?2 WHERE id = ?1")
                .bind(message_id.to_string())
                .bind(&rewritten)
                .execute(&mut *tx)
                .await?;
            rewritten
        };

        events::record(
            &mut tx,
            NewEvent::new(EventKind::ChannelMessage)
                .maybe_agent(request.agent_id)
                .metadata(json!({
                    "channel": channel_name,
                    "mentions": mentions.len(),
                    "createdTasks": created_tasks.len(),
                })),
        )
        .await?;

        tx.commit().await?;

        Ok(PostedMessage {
            message: ChannelMessage {
                id: message_id,
                channel_id: request.channel_id,
                agent_id: request.agent_id,
                content: final_body,
                reply_to_id: request.reply_to_id,
                mentions,
                created_at: now,
            },
            created_tasks,
        })
    }

    /// Messages in a channel, oldest first within the window.
    pub async fn get_messages(
        &self,
        channel_id: Uuid,
        window: MessageWindow,
    ) -> EngineResult<Vec<ChannelMessage>> {
        self.get_channel(channel_id).await?;

        let mut sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM channel_messages WHERE channel_id = ?"
        );
        let mut times: Vec<DateTime<Utc>> = Vec::new();
        if let Some(since) = window.since {
            sql.push_str(" AND created_at > ?");
            times.push(since);
        }
        if let Some(before) = window.before {
            sql.push_str(" AND created_at < ?");
            times.push(before);
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(channel_id.to_string());
        for time in times {
            query = query.bind(time);
        }
        query = query.bind(window.limit.unwrap_or(50).clamp(1, 500));

        let rows = query.fetch_all(self.store.pool()).await?;
        let mut messages: Vec<ChannelMessage> = rows
            .iter()
            .map(ChannelMessage::from_row)
            .collect::<Result<_, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// A thread: the parent message followed by its replies in order.
    pub async fn get_thread(
        &self,
        channel_id: Uuid,
        parent_id: Uuid,
    ) -> EngineResult<Vec<ChannelMessage>> {
        let mut conn = self.store.pool().acquire().await?;
        let parent = fetch_message(&mut conn, parent_id).await?;
        if parent.channel_id != channel_id {
            return Err(EngineError::Validation(
                "thread parent is in a different channel".into(),
            ));
        }

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM channel_messages \
             WHERE reply_to_id = ?1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(parent_id.to_string())
        .fetch_all(&mut *conn)
        .await?;

        let mut thread = vec![parent];
        for row in &rows {
            thread.push(ChannelMessage::from_row(row)?);
        }
        Ok(thread)
    }

    /// Upsert `last_read_at = now` for the pair.
    pub async fn update_read_state(&self, agent_id: Uuid, channel_id: Uuid) -> EngineResult<()> {
        self.get_channel(channel_id).await?;
        sqlx::query(
            "INSERT INTO channel_read_state (agent_id, channel_id, last_read_at) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (agent_id, channel_id) DO UPDATE SET last_read_at = excluded.last_read_at",
        )
        .bind(agent_id.to_string())
        .bind(channel_id.to_string())
        .bind(Utc::now())
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Unread messages in one channel (everything when no read-state row
    /// exists). The agent's own posts are not unread.
    pub async fn get_unread(
        &self,
        agent_id: Uuid,
        channel_id: Uuid,
    ) -> EngineResult<Vec<ChannelMessage>> {
        self.get_channel(channel_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM channel_messages m \
             WHERE m.channel_id = ?1 \
               AND (m.agent_id IS NULL OR m.agent_id != ?2) \
               AND m.created_at > COALESCE( \
                     (SELECT last_read_at FROM channel_read_state \
                      WHERE agent_id = ?2 AND channel_id = ?1), \
                     '') \
             ORDER BY m.created_at ASC, m.id ASC"
        ))
        .bind(channel_id.to_string())
        .bind(agent_id.to_string())
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| ChannelMessage::from_row(row).map_err(Into::into))
            .collect()
    }

    /// Digest read. With a channel, the newest unread messages there; with
    /// none, the newest `limit` unread per channel across all channels,
    /// the author annotated with `… in #channel` to disambiguate.
    pub async fn read_messages(
        &self,
        agent_id: Uuid,
        options: ReadMessagesOptions,
    ) -> EngineResult<Vec<AnnotatedMessage>> {
        let limit = options.limit.unwrap_or(20).clamp(1, 200);

        let channels: Vec<(Uuid, String)> = match options.channel_id {
            Some(id) => {
                let channel = self.get_channel(id).await?;
                vec![(channel.id, channel.name)]
            }
            None => self
                .list_channels()
                .await?
                .into_iter()
                .map(|c| (c.id, c.name))
                .collect(),
        };
        let annotate = options.channel_id.is_none();

        let mut digest = Vec::new();
        for (channel_id, channel_name) in channels {
            let rows = sqlx::query(
                "SELECT m.id, m.channel_id, m.agent_id, m.content, m.reply_to_id, m.mentions, \
                        m.created_at, a.name AS author_name \
                 FROM channel_messages m LEFT JOIN agents a ON a.id = m.agent_id \
                 WHERE m.channel_id = ?1 \
                   AND (m.agent_id IS NULL OR m.agent_id != ?2) \
                   AND m.created_at > COALESCE( \
                         (SELECT last_read_at FROM channel_read_state \
                          WHERE agent_id = ?2 AND channel_id = ?1), \
                         '') \
                 ORDER BY m.created_at DESC, m.id DESC LIMIT ?3",
            )
            .bind(channel_id.to_string())
            .bind(agent_id.to_string())
            .bind(limit)
            .fetch_all(self.store.pool())
            .await?;

            if rows.is_empty() {
                continue;
            }
            for row in rows.iter().rev() {
                let message = ChannelMessage::from_row(row)?;
                let author: Option<String> = row.try_get("author_name")?;
                let author = author.unwrap_or_else(|| "Human".to_string());
                let agent_name = if annotate {
                    format!("{} in #{}", author, channel_name)
                } else {
                    author
                };
                digest.push(AnnotatedMessage {
                    id: message.id,
                    channel_id: message.channel_id,
                    channel_name: channel_name.clone(),
                    agent_name,
                    content: message.content,
                    reply_to_id: message.reply_to_id,
                    mentions: message.mentions,
                    created_at: message.created_at,
                });
            }

            if options.mark_read {
                self.update_read_state(agent_id, channel_id).await?;
            }
        }
        Ok(digest)
    }

    /// Messages that @-mention the agent, newest first.
    pub async fn get_mentions(
        &self,
        agent_id: Uuid,
        query: MentionQuery,
    ) -> EngineResult<Vec<AnnotatedMessage>> {
        let mut sql = String::from(
            "SELECT m.id, m.channel_id, m.agent_id, m.content, m.reply_to_id, m.mentions, \
                    m.created_at, a.name AS author_name, c.name AS channel_name \
             FROM channel_messages m \
             JOIN channels c ON c.id = m.channel_id \
             LEFT JOIN agents a ON a.id = m.agent_id \
             WHERE m.mentions LIKE ?",
        );
        let mut params = vec![format!("%\"{}\"%", agent_id)];
        if let Some(channel_id) = query.channel_id {
            sql.push_str(" AND m.channel_id = ?");
            params.push(channel_id.to_string());
        }
        if query.unread_only {
            sql.push_str(
                " AND m.created_at > COALESCE( \
                       (SELECT last_read_at FROM channel_read_state r \
                        WHERE r.agent_id = ? AND r.channel_id = m.channel_id), \
                       '')",
            );
            params.push(agent_id.to_string());
        }
        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC LIMIT 100");

        let mut q = sqlx::query(&sql);
        for param in params {
            q = q.bind(param);
        }
        let rows = q.fetch_all(self.store.pool()).await?;

        let mut mentions = Vec::new();
        for row in &rows {
            let message = ChannelMessage::from_row(row)?;
            let author: Option<String> = row.try_get("author_name")?;
            mentions.push(AnnotatedMessage {
                id: message.id,
                channel_id: message.channel_id,
                channel_name: row.try_get("channel_name")?,
                agent_name: author.unwrap_or_else(|| "Human".to_string()),
                content: message.content,
                reply_to_id: message.reply_to_id,
                mentions: message.mentions,
                created_at: message.created_at,
            });
        }
        Ok(mentions)
    }
}

fn dedupe(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = std::collections::HashSet::new();
    ids.iter().filter(|id| seen.insert(**id)).copied().collect()
}

/// Split the `/task ` command prefix off, tolerating leading whitespace.
/// Returns whether the prefix was present and the body to store.
fn strip_task_prefix(content: &str) -> (bool, String) {
    let trimmed = content.trim_start();
    match trimmed.strip_prefix(TASK_COMMAND_PREFIX) {
        Some(rest) => (true, rest.to_string()),
        None => (false, content.to_string()),
    }
}

async fn fetch_message(
    conn: &mut SqliteConnection,
    id: Uuid,
) -> EngineResult<ChannelMessage> {
    let row = sqlx::query(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM channel_messages WHERE id = ?1"
    ))
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?;
    match row {
        Some(row) => Ok(ChannelMessage::from_row(&row)?),
        None => Err(EngineError::NotFound("message", id.to_string())),
    }
}
