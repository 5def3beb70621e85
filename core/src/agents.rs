/// Agent registry: identity, role, capabilities, status, capacity.
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, EventKind, NewEvent};
use crate::model::{encode_list, Agent, AgentStatus};
use crate::store::{new_id, SqliteStore};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqliteConnection;
use uuid::Uuid;

const AGENT_COLUMNS: &str = "id, name, is_lead, status, role, description, capabilities, \
                             max_tasks, created_at, last_updated_at";

/// Parameters for joining the swarm.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// Caller-supplied id, e.g. to rejoin under a previous identity.
    #[serde(default)]
    pub requested_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub lead: bool,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub max_tasks: Option<i64>,
}

/// Partial profile update. Capacity is fixed at join time and is not part
/// of this operation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

pub struct AgentRegistry {
    store: SqliteStore,
}

impl AgentRegistry {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Register an agent. Fails on duplicate id or name, or when a second
    /// lead tries to join.
    pub async fn join(&self, request: JoinRequest) -> EngineResult<Agent> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("agent name is required".into()));
        }
        let max_tasks = request.max_tasks.unwrap_or(1);
        if max_tasks < 1 {
            return Err(EngineError::Validation(
                "maxTasks must be at least 1".into(),
            ));
        }

        let mut tx = self.store.begin().await?;

        if let Some(id) = request.requested_id {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM agents WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_some() {
                return Err(EngineError::Conflict(format!(
                    "an agent with id {} already exists",
                    id
                )));
            }
        }

        let name_taken: Option<String> =
            sqlx::query_scalar("SELECT id FROM agents WHERE name = ?1")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;
        if name_taken.is_some() {
            return Err(EngineError::Conflict(format!(
                "an agent named '{}' already exists",
                name
            )));
        }

        if request.lead {
            let lead: Option<String> =
                sqlx::query_scalar("SELECT name FROM agents WHERE is_lead = 1")
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(existing) = lead {
                return Err(EngineError::Conflict(format!(
                    "a lead agent already exists ('{}')",
                    existing
                )));
            }
        }

        let id = request.requested_id.unwrap_or_else(new_id);
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO agents (id, name, is_lead, status, role, description, capabilities, \
                                 max_tasks, created_at, last_updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             RETURNING {AGENT_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(name)
        .bind(request.lead)
        .bind(AgentStatus::Idle.to_string())
        .bind(&request.role)
        .bind(&request.description)
        .bind(encode_list(&request.capabilities)?)
        .bind(max_tasks)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        let agent = Agent::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::AgentJoined)
                .agent(agent.id)
                .new_value(&agent.name)
                .metadata(json!({ "isLead": agent.is_lead, "role": agent.role })),
        )
        .await?;

        tx.commit().await?;
        tracing::info!(agent = %agent.name, lead = agent.is_lead, "agent joined");
        Ok(agent)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Agent> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(Agent::from_row(&row)?),
            None => Err(EngineError::NotFound("agent", id.to_string())),
        }
    }

    pub async fn get_by_name(&self, name: &str) -> EngineResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE name = ?1"
        ))
        .bind(name)
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| Agent::from_row(&r).map_err(Into::into)).transpose()
    }

    pub async fn list(&self) -> EngineResult<Vec<Agent>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY created_at ASC"
        ))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| Agent::from_row(row).map_err(Into::into))
            .collect()
    }

    /// The unique lead, if one has joined.
    pub async fn lead(&self) -> EngineResult<Option<Agent>> {
        let row = sqlx::query(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE is_lead = 1"
        ))
        .fetch_optional(self.store.pool())
        .await?;
        row.map(|r| Agent::from_row(&r).map_err(Into::into)).transpose()
    }

    /// Explicit status change (e.g. an agent going offline).
    pub async fn update_status(&self, id: Uuid, status: AgentStatus) -> EngineResult<Agent> {
        let mut tx = self.store.begin().await?;
        let agent = set_status(&mut tx, id, status).await?;
        tx.commit().await?;
        Ok(agent)
    }

    pub async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> EngineResult<Agent> {
        let current = self.get(id).await?;
        let row = sqlx::query(&format!(
            "UPDATE agents SET role = ?2, description = ?3, capabilities = ?4, \
                               last_updated_at = ?5 \
             WHERE id = ?1 RETURNING {AGENT_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.role.or(current.role))
        .bind(update.description.or(current.description))
        .bind(encode_list(
            update.capabilities.as_deref().unwrap_or(&current.capabilities),
        )?)
        .bind(Utc::now())
        .fetch_one(self.store.pool())
        .await?;
        Ok(Agent::from_row(&row)?)
    }

    /// Heartbeat: bump `last_updated_at` so dashboards can spot stale agents.
    pub async fn touch(&self, id: Uuid) -> EngineResult<()> {
        let result = sqlx::query("UPDATE agents SET last_updated_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(self.store.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound("agent", id.to_string()));
        }
        Ok(())
    }

    /// Remove an agent. Owned tasks, services, read-state and inbox rows
    /// cascade with the row.
    pub async fn delete(&self, id: Uuid) -> EngineResult<()> {
        let agent = self.get(id).await?;
        let mut tx = self.store.begin().await?;
        sqlx::query("DELETE FROM agents WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        events::record(
            &mut tx,
            NewEvent::new(EventKind::AgentLeft)
                .agent(id)
                .old_value(&agent.name),
        )
        .await?;
        tx.commit().await?;
        tracing::info!(agent = %agent.name, "agent left");
        Ok(())
    }

    /// Capacity predicate: active tasks strictly below `max_tasks`.
    pub async fn has_capacity(&self, id: Uuid) -> EngineResult<bool> {
        let agent = self.get(id).await?;
        let mut conn = self.store.pool().acquire().await?;
        let count = active_task_count(&mut conn, id).await?;
        Ok(count < agent.max_tasks)
    }
}

/// Count of tasks currently occupying the agent (pending or in progress).
pub(crate) async fn active_task_count(
    conn: &mut SqliteConnection,
    agent_id: Uuid,
) -> EngineResult<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM agent_tasks \
         WHERE agent_id = ?1 AND status IN ('pending', 'in_progress')",
    )
    .bind(agent_id.to_string())
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Set an agent's status inside the caller's transaction, emitting
/// `agent_status_change` when it actually changes.
pub(crate) async fn set_status(
    conn: &mut SqliteConnection,
    id: Uuid,
    status: AgentStatus,
) -> EngineResult<Agent> {
    let row = sqlx::query(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    let agent = match row {
        Some(row) => Agent::from_row(&row)?,
        None => return Err(EngineError::NotFound("agent", id.to_string())),
    };
    if agent.status == status {
        return Ok(agent);
    }

    let row = sqlx::query(&format!(
        "UPDATE agents SET status = ?2, last_updated_at = ?3 WHERE id = ?1 \
         RETURNING {AGENT_COLUMNS}"
    ))
    .bind(id.to_string())
    .bind(status.to_string())
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await?;
    let updated = Agent::from_row(&row)?;

    events::record(
        &mut *conn,
        NewEvent::new(EventKind::AgentStatusChange)
            .agent(id)
            .old_value(agent.status.to_string())
            .new_value(status.to_string()),
    )
    .await?;
    Ok(updated)
}

/// Recompute busy/idle from current occupancy. Called on every task status
/// transition that changes occupancy. Offline agents are left alone.
pub(crate) async fn refresh_status_from_capacity(
    conn: &mut SqliteConnection,
    agent_id: Uuid,
) -> EngineResult<()> {
    let current: Option<String> = sqlx::query_scalar("SELECT status FROM agents WHERE id = ?1")
        .bind(agent_id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    let Some(current) = current else {
        return Ok(());
    };
    if current == AgentStatus::Offline.to_string() {
        return Ok(());
    }

    let active = active_task_count(&mut *conn, agent_id).await?;
    let target = if active > 0 {
        AgentStatus::Busy
    } else {
        AgentStatus::Idle
    };
    if current != target.to_string() {
        set_status(conn, agent_id, target).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, EventLog};

    async fn registry() -> AgentRegistry {
        let store = SqliteStore::open_in_memory().await.unwrap();
        AgentRegistry::new(store)
    }

    fn worker(name: &str) -> JoinRequest {
        JoinRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn join_creates_idle_agent_and_logs_event() {
        let registry = registry().await;
        let agent = registry.join(worker("w1")).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
        assert_eq!(agent.max_tasks, 1);
        assert!(!agent.is_lead);

        let log = EventLog::new(registry.store.clone());
        let events = log.list(EventFilter::default()).await.unwrap();
        assert_eq!(events[0].event_type, "agent_joined");
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected() {
        let registry = registry().await;
        registry.join(worker("w1")).await.unwrap();
        let err = registry.join(worker("w1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn requested_id_is_honored_and_guarded() {
        let registry = registry().await;
        let id = new_id();
        let agent = registry
            .join(JoinRequest {
                requested_id: Some(id),
                ..worker("w1")
            })
            .await
            .unwrap();
        assert_eq!(agent.id, id);

        let err = registry
            .join(JoinRequest {
                requested_id: Some(id),
                ..worker("w2")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn only_one_lead_may_exist() {
        let registry = registry().await;
        registry
            .join(JoinRequest {
                lead: true,
                ..worker("lead")
            })
            .await
            .unwrap();
        let err = registry
            .join(JoinRequest {
                lead: true,
                ..worker("pretender")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        let lead = registry.lead().await.unwrap().unwrap();
        assert_eq!(lead.name, "lead");
    }

    #[tokio::test]
    async fn status_change_records_old_and_new() {
        let registry = registry().await;
        let agent = registry.join(worker("w1")).await.unwrap();
        registry
            .update_status(agent.id, AgentStatus::Offline)
            .await
            .unwrap();

        let log = EventLog::new(registry.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("agent_status_change".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value.as_deref(), Some("idle"));
        assert_eq!(events[0].new_value.as_deref(), Some("offline"));

        // Setting the same status again is a no-op.
        registry
            .update_status(agent.id, AgentStatus::Offline)
            .await
            .unwrap();
        let events = log
            .list(EventFilter {
                event_type: Some("agent_status_change".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn profile_update_is_partial_and_leaves_capacity_alone() {
        let registry = registry().await;
        let agent = registry
            .join(JoinRequest {
                role: Some("backend".to_string()),
                max_tasks: Some(2),
                ..worker("w1")
            })
            .await
            .unwrap();

        let updated = registry
            .update_profile(
                agent.id,
                ProfileUpdate {
                    capabilities: Some(vec!["rust".to_string(), "sql".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.role.as_deref(), Some("backend"));
        assert_eq!(updated.capabilities, vec!["rust", "sql"]);
        assert_eq!(updated.max_tasks, 2);
    }

    #[tokio::test]
    async fn delete_emits_agent_left() {
        let registry = registry().await;
        let agent = registry.join(worker("w1")).await.unwrap();
        registry.delete(agent.id).await.unwrap();

        assert!(matches!(
            registry.get(agent.id).await.unwrap_err(),
            EngineError::NotFound(_, _)
        ));

        let log = EventLog::new(registry.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("agent_left".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn fresh_agent_has_capacity() {
        let registry = registry().await;
        let agent = registry.join(worker("w1")).await.unwrap();
        assert!(registry.has_capacity(agent.id).await.unwrap());
    }
}
