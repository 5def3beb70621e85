/// Append-only event log.
///
/// Every state mutation in the engine writes one row here inside the same
/// transaction as the change that produced it; the observability surface
/// reads nothing else. Rows are never updated or deleted.
use crate::errors::EngineResult;
use crate::model::EventLogEntry;
use crate::store::{new_id, SqliteStore};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use uuid::Uuid;

/// Kinds of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AgentJoined,
    AgentLeft,
    AgentStatusChange,
    TaskCreated,
    TaskOffered,
    TaskAccepted,
    TaskRejected,
    TaskClaimed,
    TaskReleased,
    TaskStatusChange,
    TaskProgress,
    ChannelMessage,
    ServiceRegistered,
    ServiceUnregistered,
    ServiceStatusChange,
    ScheduleTriggered,
    ScheduleDisabled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentJoined => "agent_joined",
            EventKind::AgentLeft => "agent_left",
            EventKind::AgentStatusChange => "agent_status_change",
            EventKind::TaskCreated => "task_created",
            EventKind::TaskOffered => "task_offered",
            EventKind::TaskAccepted => "task_accepted",
            EventKind::TaskRejected => "task_rejected",
            EventKind::TaskClaimed => "task_claimed",
            EventKind::TaskReleased => "task_released",
            EventKind::TaskStatusChange => "task_status_change",
            EventKind::TaskProgress => "task_progress",
            EventKind::ChannelMessage => "channel_message",
            EventKind::ServiceRegistered => "service_registered",
            EventKind::ServiceUnregistered => "service_unregistered",
            EventKind::ServiceStatusChange => "service_status_change",
            EventKind::ScheduleTriggered => "schedule_triggered",
            EventKind::ScheduleDisabled => "schedule_disabled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An event about to be appended, built up with the usual setters.
#[derive(Debug, Clone)]
pub struct NewEvent {
    kind: EventKind,
    agent_id: Option<Uuid>,
    task_id: Option<Uuid>,
    old_value: Option<String>,
    new_value: Option<String>,
    metadata: Value,
}

impl NewEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            agent_id: None,
            task_id: None,
            old_value: None,
            new_value: None,
            metadata: Value::Null,
        }
    }

    pub fn agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn maybe_agent(mut self, agent_id: Option<Uuid>) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn old_value(mut self, value: impl Into<String>) -> Self {
        self.old_value = Some(value.into());
        self
    }

    pub fn new_value(mut self, value: impl Into<String>) -> Self {
        self.new_value = Some(value.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Append one event row inside the caller's transaction.
pub async fn record(conn: &mut SqliteConnection, event: NewEvent) -> EngineResult<Uuid> {
    let id = new_id();
    let metadata = if event.metadata.is_null() {
        None
    } else {
        Some(serde_json::to_string(&event.metadata)?)
    };
    sqlx::query(
        r#"
        INSERT INTO agent_log (id, event_type, agent_id, task_id, old_value, new_value, metadata, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(id.to_string())
    .bind(event.kind.as_str())
    .bind(event.agent_id.map(|v| v.to_string()))
    .bind(event.task_id.map(|v| v.to_string()))
    .bind(event.old_value)
    .bind(event.new_value)
    .bind(metadata)
    .bind(Utc::now())
    .execute(conn)
    .await?;
    Ok(id)
}

/// Filters for the event-log read surface.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub agent_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub limit: Option<i64>,
}

/// Read side of the log.
pub struct EventLog {
    store: SqliteStore,
}

impl EventLog {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Newest-first listing for dashboards.
    pub async fn list(&self, filter: EventFilter) -> EngineResult<Vec<EventLogEntry>> {
        let mut sql = String::from(
            "SELECT id, event_type, agent_id, task_id, old_value, new_value, metadata, created_at \
             FROM agent_log",
        );
        let mut clauses = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(agent_id) = filter.agent_id {
            clauses.push("agent_id = ?".to_string());
            params.push(agent_id.to_string());
        }
        if let Some(task_id) = filter.task_id {
            clauses.push("task_id = ?".to_string());
            params.push(task_id.to_string());
        }
        if let Some(event_type) = filter.event_type {
            clauses.push("event_type = ?".to_string());
            params.push(event_type);
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        query = query.bind(filter.limit.unwrap_or(100).clamp(1, 1000));

        let rows = query.fetch_all(self.store.pool()).await?;
        rows.iter()
            .map(|row| EventLogEntry::from_row(row).map_err(Into::into))
            .collect()
    }

    /// Chronological view of one task's lifecycle, for task detail pages.
    pub async fn task_history(&self, task_id: Uuid) -> EngineResult<Vec<EventLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, event_type, agent_id, task_id, old_value, new_value, metadata, created_at \
             FROM agent_log WHERE task_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .bind(task_id.to_string())
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| EventLogEntry::from_row(row).map_err(Into::into))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn record_one(store: &SqliteStore, event: NewEvent) -> Uuid {
        let mut tx = store.begin().await.unwrap();
        let id = record(&mut tx, event).await.unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn events_commit_with_their_transaction() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let task_id = new_id();

        // Rolled-back transactions leave no trace.
        {
            let mut tx = store.begin().await.unwrap();
            record(
                &mut tx,
                NewEvent::new(EventKind::TaskCreated).task(task_id),
            )
            .await
            .unwrap();
            // dropped without commit
        }

        let log = EventLog::new(store.clone());
        assert!(log.task_history(task_id).await.unwrap().is_empty());

        record_one(&store, NewEvent::new(EventKind::TaskCreated).task(task_id)).await;
        assert_eq!(log.task_history(task_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn listing_is_reverse_chronological() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let agent_id = new_id();
        record_one(
            &store,
            NewEvent::new(EventKind::AgentJoined).agent(agent_id),
        )
        .await;
        record_one(
            &store,
            NewEvent::new(EventKind::AgentStatusChange)
                .agent(agent_id)
                .old_value("idle")
                .new_value("busy"),
        )
        .await;

        let log = EventLog::new(store);
        let events = log.list(EventFilter::default()).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "agent_status_change");
        assert_eq!(events[1].event_type, "agent_joined");
    }

    #[tokio::test]
    async fn filters_narrow_the_listing() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let a = new_id();
        let b = new_id();
        record_one(&store, NewEvent::new(EventKind::AgentJoined).agent(a)).await;
        record_one(&store, NewEvent::new(EventKind::AgentJoined).agent(b)).await;
        record_one(
            &store,
            NewEvent::new(EventKind::TaskCreated)
                .agent(a)
                .task(new_id())
                .metadata(json!({"source": "mcp"})),
        )
        .await;

        let log = EventLog::new(store);
        let events = log
            .list(EventFilter {
                agent_id: Some(a),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        let events = log
            .list(EventFilter {
                event_type: Some("agent_joined".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        let events = log
            .list(EventFilter {
                agent_id: Some(a),
                event_type: Some("agent_joined".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn task_history_is_chronological() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let task_id = new_id();
        record_one(&store, NewEvent::new(EventKind::TaskCreated).task(task_id)).await;
        record_one(&store, NewEvent::new(EventKind::TaskClaimed).task(task_id)).await;
        record_one(
            &store,
            NewEvent::new(EventKind::TaskStatusChange)
                .task(task_id)
                .old_value("pending")
                .new_value("in_progress"),
        )
        .await;

        let log = EventLog::new(store);
        let history = log.task_history(task_id).await.unwrap();
        let kinds: Vec<_> = history.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["task_created", "task_claimed", "task_status_change"]
        );
    }
}
