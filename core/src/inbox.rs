/// Lead inbox: externally-originated messages awaiting triage, and the
/// delegation operation that turns one into a task carrying its external
/// chat context.
use crate::errors::{EngineError, EngineResult};
use crate::model::{truncate, Agent, ExternalContext, InboxMessage, Task, TaskSource};
use crate::store::{new_id, SqliteStore};
use crate::tasks::{self, CreateTask};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

const INBOX_COLUMNS: &str = "id, agent_id, content, slack_channel_id, slack_thread_ts, \
                             slack_user_id, delegated_task_id, created_at";

/// A message arriving from the chat bridge, addressed to the lead.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPush {
    pub content: String,
    #[serde(default)]
    pub slack_channel_id: Option<String>,
    #[serde(default)]
    pub slack_thread_ts: Option<String>,
    #[serde(default)]
    pub slack_user_id: Option<String>,
}

/// Options for delegating an inbox message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateOptions {
    /// Override for the task description; defaults to the inbox content.
    #[serde(default)]
    pub task_description: Option<String>,
    #[serde(default)]
    pub offer_mode: bool,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
}

/// Aggregate the tray widgets render: unread totals, pool pressure, and a
/// few mention previews.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxSummary {
    pub unread_messages: i64,
    pub unread_mentions: i64,
    pub offered_tasks: i64,
    pub pool_tasks: i64,
    pub in_progress_tasks: i64,
    pub mention_previews: Vec<MentionPreview>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionPreview {
    pub channel_name: String,
    pub author_name: String,
    pub excerpt: String,
    pub created_at: DateTime<Utc>,
}

pub struct Inbox {
    store: SqliteStore,
}

impl Inbox {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Insert a bridge message for the lead. Fails when no lead has joined
    /// yet; the bridge retries later.
    pub async fn push(&self, message: InboxPush) -> EngineResult<InboxMessage> {
        if message.content.trim().is_empty() {
            return Err(EngineError::Validation("message content is required".into()));
        }
        let lead_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM agents WHERE is_lead = 1")
                .fetch_optional(self.store.pool())
                .await?;
        let Some(lead_id) = lead_id else {
            return Err(EngineError::NotFound("lead agent", "none joined".into()));
        };

        let row = sqlx::query(&format!(
            "INSERT INTO inbox_messages (id, agent_id, content, slack_channel_id, \
                                         slack_thread_ts, slack_user_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             RETURNING {INBOX_COLUMNS}"
        ))
        .bind(new_id().to_string())
        .bind(&lead_id)
        .bind(message.content.trim())
        .bind(&message.slack_channel_id)
        .bind(&message.slack_thread_ts)
        .bind(&message.slack_user_id)
        .bind(Utc::now())
        .fetch_one(self.store.pool())
        .await?;
        Ok(InboxMessage::from_row(&row)?)
    }

    /// Read one inbox message. Leads only, and only their own queue.
    pub async fn get(&self, id: Uuid, caller: &Agent) -> EngineResult<InboxMessage> {
        if !caller.is_lead {
            return Err(EngineError::Unauthorized(
                "only the lead can read the inbox".into(),
            ));
        }
        let row = sqlx::query(&format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_messages WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        let Some(row) = row else {
            return Err(EngineError::NotFound("inbox message", id.to_string()));
        };
        let message = InboxMessage::from_row(&row)?;
        if message.agent_id != caller.id {
            return Err(EngineError::Unauthorized(
                "this inbox message is not addressed to you".into(),
            ));
        }
        Ok(message)
    }

    /// The caller's inbox, newest first. Undelegated messages only unless
    /// `include_delegated`.
    pub async fn list(
        &self,
        caller: &Agent,
        include_delegated: bool,
    ) -> EngineResult<Vec<InboxMessage>> {
        if !caller.is_lead {
            return Err(EngineError::Unauthorized(
                "only the lead can read the inbox".into(),
            ));
        }
        let mut sql = format!(
            "SELECT {INBOX_COLUMNS} FROM inbox_messages WHERE agent_id = ?1"
        );
        if !include_delegated {
            sql.push_str(" AND delegated_task_id IS NULL");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let rows = sqlx::query(&sql)
            .bind(caller.id.to_string())
            .fetch_all(self.store.pool())
            .await?;
        rows.iter()
            .map(|row| InboxMessage::from_row(row).map_err(Into::into))
            .collect()
    }

    /// Turn an inbox message into a task for a worker, carrying the
    /// external chat context so replies route back to the right thread.
    /// Delegation is irrevocable: a message delegates at most once.
    pub async fn delegate(
        &self,
        inbox_message_id: Uuid,
        caller: &Agent,
        target_agent_id: Uuid,
        options: DelegateOptions,
    ) -> EngineResult<(Task, InboxMessage)> {
        let message = self.get(inbox_message_id, caller).await?;
        if message.delegated_task_id.is_some() {
            return Err(EngineError::Conflict(
                "inbox message was already delegated".into(),
            ));
        }

        let mut tx = self.store.begin().await?;

        let target = tasks::fetch_agent(&mut tx, target_agent_id).await?;
        if target.is_lead {
            return Err(EngineError::Validation(
                "cannot delegate to another lead".into(),
            ));
        }

        let description = options
            .task_description
            .unwrap_or_else(|| message.content.clone());
        let external_context = ExternalContext {
            channel_id: message.slack_channel_id.clone(),
            thread_ref: message.slack_thread_ts.clone(),
            user_id: message.slack_user_id.clone(),
            repo: None,
        };

        let task = tasks::create_in_conn(
            &mut tx,
            CreateTask {
                source: Some(TaskSource::Slack),
                agent_id: Some(target_agent_id),
                creator_agent_id: Some(caller.id),
                offer_mode: options.offer_mode,
                parent_task_id: options.parent_task_id,
                external_context: Some(external_context),
                ..CreateTask::new(description)
            },
            true,
        )
        .await?;

        // The stamp is conditional on the message still being undelegated,
        // so concurrent delegations cannot both win.
        let stamped = sqlx::query(
            "UPDATE inbox_messages SET delegated_task_id = ?2 \
             WHERE id = ?1 AND delegated_task_id IS NULL",
        )
        .bind(inbox_message_id.to_string())
        .bind(task.id.to_string())
        .execute(&mut *tx)
        .await?;
        if stamped.rows_affected() == 0 {
            return Err(EngineError::Conflict(
                "inbox message was already delegated".into(),
            ));
        }

        tx.commit().await?;

        let message = self.get(inbox_message_id, caller).await?;
        Ok((task, message))
    }

    /// One-transaction aggregate for tray widgets and the lead's tooling.
    pub async fn summary(&self, agent_id: Uuid) -> EngineResult<InboxSummary> {
        let mut tx = self.store.begin().await?;
        let agent_param = agent_id.to_string();
        let mention_pattern = format!("%\"{}\"%", agent_id);

        let unread_messages: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages m \
             WHERE (m.agent_id IS NULL OR m.agent_id != ?1) \
               AND m.created_at > COALESCE( \
                     (SELECT last_read_at FROM channel_read_state r \
                      WHERE r.agent_id = ?1 AND r.channel_id = m.channel_id), \
                     '')",
        )
        .bind(&agent_param)
        .fetch_one(&mut *tx)
        .await?;

        let unread_mentions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_messages m \
             WHERE m.mentions LIKE ?2 \
               AND (m.agent_id IS NULL OR m.agent_id != ?1) \
               AND m.created_at > COALESCE( \
                     (SELECT last_read_at FROM channel_read_state r \
                      WHERE r.agent_id = ?1 AND r.channel_id = m.channel_id), \
                     '')",
        )
        .bind(&agent_param)
        .bind(&mention_pattern)
        .fetch_one(&mut *tx)
        .await?;

        let offered_tasks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agent_tasks WHERE status = 'offered' AND offered_to = ?1",
        )
        .bind(&agent_param)
        .fetch_one(&mut *tx)
        .await?;

        let pool_tasks: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM agent_tasks WHERE status = 'unassigned'")
                .fetch_one(&mut *tx)
                .await?;

        let in_progress_tasks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agent_tasks WHERE agent_id = ?1 AND status = 'in_progress'",
        )
        .bind(&agent_param)
        .fetch_one(&mut *tx)
        .await?;

        let preview_rows = sqlx::query(
            "SELECT c.name AS channel_name, a.name AS author_name, m.content, m.created_at \
             FROM channel_messages m \
             JOIN channels c ON c.id = m.channel_id \
             LEFT JOIN agents a ON a.id = m.agent_id \
             WHERE m.mentions LIKE ?2 \
               AND (m.agent_id IS NULL OR m.agent_id != ?1) \
               AND m.created_at > COALESCE( \
                     (SELECT last_read_at FROM channel_read_state r \
                      WHERE r.agent_id = ?1 AND r.channel_id = m.channel_id), \
                     '') \
             ORDER BY m.created_at DESC LIMIT 3",
        )
        .bind(&agent_param)
        .bind(&mention_pattern)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mention_previews = preview_rows
            .iter()
            .map(|row| {
                let author: Option<String> = row.try_get("author_name")?;
                let content: String = row.try_get("content")?;
                Ok(MentionPreview {
                    channel_name: row.try_get("channel_name")?,
                    author_name: author.unwrap_or_else(|| "Human".to_string()),
                    excerpt: truncate(&content, 100),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(InboxSummary {
            unread_messages,
            unread_mentions,
            offered_tasks,
            pool_tasks,
            in_progress_tasks,
            mention_previews,
        })
    }
}
