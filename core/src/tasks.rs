/// Task engine: the task pool, offer/accept protocol, dependency gating,
/// and capacity-aware assignment.
///
/// Claim, accept, reject and release are conditional UPDATEs whose WHERE
/// clause repeats the expected status (and `offered_to` on offer paths), so
/// a losing racer gets a distinct error instead of a silent overwrite.
use crate::agents;
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, EventKind, NewEvent};
use crate::model::{
    clamp_priority, encode_list, truncate, Agent, ExternalContext, Task, TaskSource, TaskStatus,
};
use crate::store::{new_id, SqliteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

const TASK_COLUMNS: &str = "id, task, status, source, agent_id, creator_agent_id, offered_to, \
                            offered_at, accepted_at, rejection_reason, task_type, tags, priority, \
                            depends_on, parent_task_id, epic_id, external_context, created_at, \
                            last_updated_at, finished_at, output, failure_reason, progress";

/// Parameters for creating a task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    pub task: String,
    #[serde(default)]
    pub source: Option<TaskSource>,
    /// Target agent for direct assignment (or for an offer with
    /// `offer_mode`).
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub creator_agent_id: Option<Uuid>,
    /// Propose instead of assign: the target must accept before the task
    /// becomes theirs.
    #[serde(default)]
    pub offer_mode: bool,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub epic_id: Option<Uuid>,
    #[serde(default)]
    pub external_context: Option<ExternalContext>,
}

impl CreateTask {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            source: None,
            agent_id: None,
            creator_agent_id: None,
            offer_mode: false,
            task_type: None,
            tags: Vec::new(),
            priority: None,
            depends_on: Vec::new(),
            parent_task_id: None,
            epic_id: None,
            external_context: None,
        }
    }
}

/// Result of the dependency resolver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCheck {
    pub ready: bool,
    pub blocked_by: Vec<Uuid>,
}

/// Exact task counts grouped by status.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatistics {
    pub total: i64,
    pub by_status: std::collections::BTreeMap<String, i64>,
}

/// Filters for `list`. `ready_only` is applied in memory after the SQL
/// filter, following the dependency resolver.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub agent_id: Option<Uuid>,
    #[serde(default)]
    pub unassigned: bool,
    #[serde(default)]
    pub offered_to: Option<Uuid>,
    #[serde(default)]
    pub ready_only: bool,
    #[serde(default)]
    pub task_type: Option<String>,
    /// Match-any over the serialized tag list.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-text search over the task description.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

pub struct TaskEngine {
    store: SqliteStore,
}

impl TaskEngine {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a task. Initial status is inferred: an offer target makes it
    /// `offered`, a direct assignee makes it `pending`, otherwise it lands
    /// in the unassigned pool.
    pub async fn create(&self, request: CreateTask) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = create_in_conn(&mut tx, request, true).await?;
        tx.commit().await?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: Uuid) -> EngineResult<Task> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(Task::from_row(&row)?),
            None => Err(EngineError::NotFound("task", id.to_string())),
        }
    }

    /// Filtered listing ordered by priority, then recency.
    pub async fn list(&self, filter: TaskFilter) -> EngineResult<Vec<Task>> {
        let mut sql = format!("SELECT {TASK_COLUMNS} FROM agent_tasks");
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<String> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?".into());
            params.push(status.to_string());
        }
        if let Some(agent_id) = filter.agent_id {
            clauses.push("agent_id = ?".into());
            params.push(agent_id.to_string());
        }
        if filter.unassigned {
            clauses.push("status = 'unassigned'".into());
        }
        if let Some(offered_to) = filter.offered_to {
            clauses.push("offered_to = ?".into());
            params.push(offered_to.to_string());
        }
        if let Some(task_type) = &filter.task_type {
            clauses.push("task_type = ?".into());
            params.push(task_type.clone());
        }
        if !filter.tags.is_empty() {
            let tag_clauses: Vec<String> =
                filter.tags.iter().map(|_| "tags LIKE ?".into()).collect();
            clauses.push(format!("({})", tag_clauses.join(" OR ")));
            for tag in &filter.tags {
                params.push(format!("%\"{}\"%", tag));
            }
        }
        if let Some(search) = &filter.search {
            clauses.push("task LIKE ?".into());
            params.push(format!("%{}%", search));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY priority DESC, last_updated_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql);
        for param in params {
            query = query.bind(param);
        }
        query = query.bind(filter.limit.unwrap_or(100).clamp(1, 1000));

        let rows = query.fetch_all(self.store.pool()).await?;
        let mut tasks: Vec<Task> = rows
            .iter()
            .map(Task::from_row)
            .collect::<Result<_, _>>()?;

        if filter.ready_only {
            let mut ready = Vec::with_capacity(tasks.len());
            for task in tasks {
                if self.check_dependencies_of(&task).await?.ready {
                    ready.push(task);
                }
            }
            tasks = ready;
        }
        Ok(tasks)
    }

    /// Per-status task counts for the stats surface. Counted in SQL so the
    /// figures stay exact regardless of listing caps.
    pub async fn statistics(&self) -> EngineResult<TaskStatistics> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM agent_tasks GROUP BY status")
            .fetch_all(self.store.pool())
            .await?;
        let mut stats = TaskStatistics::default();
        for row in &rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            stats.total += count;
            stats.by_status.insert(status, count);
        }
        Ok(stats)
    }

    /// Dependency resolver: ready iff every referenced task exists and is
    /// completed. Each dependency is inspected directly; transitive waits
    /// are not followed.
    pub async fn check_dependencies(&self, task_id: Uuid) -> EngineResult<DependencyCheck> {
        let task = self.get(task_id).await?;
        self.check_dependencies_of(&task).await
    }

    async fn check_dependencies_of(&self, task: &Task) -> EngineResult<DependencyCheck> {
        let mut conn = self.store.pool().acquire().await?;
        dependency_check(&mut conn, task).await
    }

    // -----------------------------------------------------------------------
    // Pool protocol
    // -----------------------------------------------------------------------

    /// Atomically claim an unassigned task. The transition is a conditional
    /// update keyed on `status = 'unassigned'`; if zero rows change the
    /// claim lost a race.
    pub async fn claim(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<Task> {
        // A racer that loses the write lock mid-transaction surfaces
        // SQLITE_BUSY instead of a zero-row update. Retrying on a fresh
        // snapshot observes the winner's commit, so the loser still gets
        // the distinct "already claimed" failure.
        let mut attempts = 0;
        loop {
            match self.claim_once(task_id, agent_id).await {
                Err(err) if is_busy(&err) && attempts < 3 => attempts += 1,
                result => return result,
            }
        }
    }

    async fn claim_once(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;
        let agent = fetch_agent(&mut tx, agent_id).await?;

        match task.status {
            TaskStatus::Unassigned => {}
            TaskStatus::Pending | TaskStatus::InProgress => {
                return Err(EngineError::Conflict(
                    "task already claimed — try a different task".into(),
                ));
            }
            other => {
                return Err(EngineError::InvalidState(format!(
                    "task is {} and cannot be claimed",
                    other
                )));
            }
        }

        let deps = dependency_check(&mut tx, &task).await?;
        if !deps.ready {
            let blocked: Vec<String> = deps.blocked_by.iter().map(|id| id.to_string()).collect();
            return Err(EngineError::InvalidState(format!(
                "task is blocked by incomplete dependencies: {}",
                blocked.join(", ")
            )));
        }

        // Advisory pre-check. Correctness comes from the conditional update
        // plus the re-check below.
        let active = agents::active_task_count(&mut tx, agent_id).await?;
        if active >= agent.max_tasks {
            return Err(EngineError::Conflict(format!(
                "agent '{}' is at capacity ({}/{})",
                agent.name, active, agent.max_tasks
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'pending', agent_id = ?2, last_updated_at = ?3 \
             WHERE id = ?1 AND status = 'unassigned' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task already claimed — try a different task".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        // Re-check after the write; a concurrent claim that slipped past the
        // advisory check rolls back here.
        let active = agents::active_task_count(&mut tx, agent_id).await?;
        if active > agent.max_tasks {
            return Err(EngineError::Conflict(format!(
                "agent '{}' is at capacity ({}/{})",
                agent.name, active, agent.max_tasks
            )));
        }

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskClaimed)
                .agent(agent_id)
                .task(task_id),
        )
        .await?;
        agents::refresh_status_from_capacity(&mut tx, agent_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Return a claimed task to the pool. Only the current assignee may
    /// release, and only from `pending` or `in_progress`.
    pub async fn release(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;

        if !matches!(task.status, TaskStatus::Pending | TaskStatus::InProgress) {
            return Err(EngineError::InvalidState(format!(
                "task is {} and cannot be released",
                task.status
            )));
        }
        if task.agent_id != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "only the assigned agent may release this task".into(),
            ));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'unassigned', agent_id = NULL, offered_to = NULL, \
                                    offered_at = NULL, accepted_at = NULL, last_updated_at = ?3 \
             WHERE id = ?1 AND agent_id = ?2 AND status IN ('pending', 'in_progress') \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task changed while releasing — refresh and retry".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskReleased)
                .agent(agent_id)
                .task(task_id),
        )
        .await?;
        agents::refresh_status_from_capacity(&mut tx, agent_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Accept an offer. Only the offer target may accept.
    pub async fn accept(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;

        if task.status != TaskStatus::Offered {
            return Err(EngineError::InvalidState(format!(
                "task is {} and has no open offer",
                task.status
            )));
        }
        if task.offered_to != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "this task is not offered to you".into(),
            ));
        }

        let now = Utc::now();
        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'pending', agent_id = ?2, accepted_at = ?3, \
                                    last_updated_at = ?3 \
             WHERE id = ?1 AND status = 'offered' AND offered_to = ?2 \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "offer changed while accepting — refresh and retry".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskAccepted)
                .agent(agent_id)
                .task(task_id),
        )
        .await?;
        agents::refresh_status_from_capacity(&mut tx, agent_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Decline an offer; the task returns to the pool.
    pub async fn reject(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        reason: Option<String>,
    ) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;

        if task.status != TaskStatus::Offered {
            return Err(EngineError::InvalidState(format!(
                "task is {} and has no open offer",
                task.status
            )));
        }
        if task.offered_to != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "this task is not offered to you".into(),
            ));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'unassigned', agent_id = NULL, offered_to = NULL, \
                                    offered_at = NULL, rejection_reason = ?3, last_updated_at = ?4 \
             WHERE id = ?1 AND status = 'offered' AND offered_to = ?2 \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(&reason)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "offer changed while rejecting — refresh and retry".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskRejected)
                .agent(agent_id)
                .task(task_id)
                .new_value(reason.unwrap_or_default()),
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Execution lifecycle
    // -----------------------------------------------------------------------

    /// `pending → in_progress`, by the assignee.
    pub async fn start(&self, task_id: Uuid, agent_id: Uuid) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;
        if task.agent_id != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "only the assigned agent may start this task".into(),
            ));
        }
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidState(format!(
                "task is {} — only pending tasks can be started",
                task.status
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'in_progress', last_updated_at = ?3 \
             WHERE id = ?1 AND agent_id = ?2 AND status = 'pending' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task changed while starting — refresh and retry".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskStatusChange)
                .agent(agent_id)
                .task(task_id)
                .old_value(TaskStatus::Pending.to_string())
                .new_value(TaskStatus::InProgress.to_string()),
        )
        .await?;
        agents::refresh_status_from_capacity(&mut tx, agent_id).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Record a progress snapshot on an active task.
    pub async fn update_progress(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        progress: String,
    ) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;
        if task.agent_id != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "only the assigned agent may report progress".into(),
            ));
        }
        if !task.status.is_active() {
            return Err(EngineError::InvalidState(format!(
                "task is {} — progress applies to active tasks",
                task.status
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET progress = ?3, last_updated_at = ?4 \
             WHERE id = ?1 AND agent_id = ?2 \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(&progress)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskProgress)
                .agent(agent_id)
                .task(task_id)
                .new_value(truncate(&progress, 500)),
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Terminal success. Returns the updated task plus the follow-up task
    /// created for the lead, if any.
    pub async fn complete(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        output: Option<String>,
    ) -> EngineResult<(Task, Option<Task>)> {
        self.finish(task_id, agent_id, TaskStatus::Completed, output, None)
            .await
    }

    /// Terminal failure.
    pub async fn fail(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        reason: String,
    ) -> EngineResult<(Task, Option<Task>)> {
        self.finish(task_id, agent_id, TaskStatus::Failed, None, Some(reason))
            .await
    }

    async fn finish(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        status: TaskStatus,
        output: Option<String>,
        failure_reason: Option<String>,
    ) -> EngineResult<(Task, Option<Task>)> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;
        if task.agent_id != Some(agent_id) {
            return Err(EngineError::Unauthorized(
                "only the assigned agent may finish this task".into(),
            ));
        }
        if !matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Paused
        ) {
            return Err(EngineError::InvalidState(format!(
                "task is {} and cannot transition to {}",
                task.status, status
            )));
        }

        let now = Utc::now();
        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = ?3, output = ?4, failure_reason = ?5, \
                                    finished_at = ?6, last_updated_at = ?6 \
             WHERE id = ?1 AND agent_id = ?2 \
               AND status IN ('pending', 'in_progress', 'paused') \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(agent_id.to_string())
        .bind(status.to_string())
        .bind(&output)
        .bind(&failure_reason)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task changed while finishing — refresh and retry".into(),
            ));
        };
        let finished = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskStatusChange)
                .agent(agent_id)
                .task(task_id)
                .old_value(task.status.to_string())
                .new_value(status.to_string())
                .metadata(json!({ "failureReason": failure_reason })),
        )
        .await?;
        agents::refresh_status_from_capacity(&mut tx, agent_id).await?;
        tx.commit().await?;

        // Post-commit, best-effort: the lead learns about worker outcomes
        // through a follow-up task, never by polling.
        let followup = self.create_followup_for_lead(&finished).await;
        Ok((finished, followup))
    }

    /// Cancel from any non-terminal state. Lead-only, except that a task's
    /// creator may always cancel their own task.
    pub async fn cancel(
        &self,
        task_id: Uuid,
        caller: &Agent,
        reason: Option<String>,
    ) -> EngineResult<(Task, Option<Task>)> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;

        if task.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "task is already {}",
                task.status
            )));
        }
        if !caller.is_lead && task.creator_agent_id != Some(caller.id) {
            return Err(EngineError::Unauthorized(
                "only the lead or the task's creator may cancel it".into(),
            ));
        }

        let now = Utc::now();
        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = 'cancelled', failure_reason = ?2, \
                                    finished_at = ?3, last_updated_at = ?3 \
             WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled') \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(&reason)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task finished while cancelling".into(),
            ));
        };
        let cancelled = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskStatusChange)
                .agent(caller.id)
                .task(task_id)
                .old_value(task.status.to_string())
                .new_value(TaskStatus::Cancelled.to_string())
                .metadata(json!({ "reason": reason })),
        )
        .await?;
        if let Some(assignee) = task.agent_id {
            agents::refresh_status_from_capacity(&mut tx, assignee).await?;
        }
        tx.commit().await?;

        let followup = self.create_followup_for_lead(&cancelled).await;
        Ok((cancelled, followup))
    }

    /// Park an unassigned task in the backlog.
    pub async fn to_backlog(&self, task_id: Uuid, caller: Uuid) -> EngineResult<Task> {
        self.move_between_pool_and_backlog(task_id, caller, TaskStatus::Unassigned, TaskStatus::Backlog)
            .await
    }

    /// Promote a backlog task back into the pool.
    pub async fn from_backlog(&self, task_id: Uuid, caller: Uuid) -> EngineResult<Task> {
        self.move_between_pool_and_backlog(task_id, caller, TaskStatus::Backlog, TaskStatus::Unassigned)
            .await
    }

    async fn move_between_pool_and_backlog(
        &self,
        task_id: Uuid,
        caller: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = fetch_task(&mut tx, task_id).await?;
        if task.status != from {
            return Err(EngineError::InvalidState(format!(
                "task is {} — only {} tasks can move to {}",
                task.status, from, to
            )));
        }

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET status = ?2, last_updated_at = ?3 \
             WHERE id = ?1 AND status = ?4 \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(to.to_string())
        .bind(Utc::now())
        .bind(from.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(EngineError::Conflict(
                "task changed while moving — refresh and retry".into(),
            ));
        };
        let task = Task::from_row(&row)?;

        events::record(
            &mut tx,
            NewEvent::new(EventKind::TaskStatusChange)
                .agent(caller)
                .task(task_id)
                .old_value(from.to_string())
                .new_value(to.to_string()),
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Follow-up to lead
    // -----------------------------------------------------------------------

    /// After a worker task reaches a terminal state, create a system-sourced
    /// task for the lead summarizing the outcome. Best-effort: failures are
    /// logged and never surface to the worker's call.
    async fn create_followup_for_lead(&self, finished: &Task) -> Option<Task> {
        match self.try_create_followup(finished).await {
            Ok(followup) => followup,
            Err(err) => {
                tracing::warn!(task = %finished.id, error = %err, "failed to create follow-up task for lead");
                None
            }
        }
    }

    async fn try_create_followup(&self, finished: &Task) -> EngineResult<Option<Task>> {
        let Some(worker_id) = finished.agent_id else {
            return Ok(None);
        };

        let mut conn = self.store.pool().acquire().await?;
        let lead_row = sqlx::query("SELECT id, name FROM agents WHERE is_lead = 1")
            .fetch_optional(&mut *conn)
            .await?;
        let Some(lead_row) = lead_row else {
            return Ok(None);
        };
        let lead_id: String = lead_row.get("id");
        let lead_id =
            Uuid::parse_str(&lead_id).map_err(|e| EngineError::Validation(e.to_string()))?;
        // The lead's own terminal tasks do not loop back.
        if lead_id == worker_id {
            return Ok(None);
        }

        let worker_name: String = sqlx::query_scalar("SELECT name FROM agents WHERE id = ?1")
            .bind(worker_id.to_string())
            .fetch_optional(&mut *conn)
            .await?
            .unwrap_or_else(|| worker_id.to_string());
        drop(conn);

        let outcome = match finished.status {
            TaskStatus::Completed => {
                let excerpt = finished
                    .output
                    .as_deref()
                    .map(|o| truncate(o, 500))
                    .unwrap_or_else(|| "(no output)".to_string());
                format!("completed.\nOutput: {}", excerpt)
            }
            TaskStatus::Failed => format!(
                "failed.\nReason: {}",
                finished.failure_reason.as_deref().unwrap_or("(none given)")
            ),
            TaskStatus::Cancelled => format!(
                "was cancelled.\nReason: {}",
                finished.failure_reason.as_deref().unwrap_or("(none given)")
            ),
            _ => return Ok(None),
        };

        let body = format!(
            "Review outcome: {}'s task \"{}\" {}\nSee task {} logs for details.",
            worker_name,
            truncate(&finished.task, 200),
            outcome,
            finished.id
        );

        let followup = self
            .create(CreateTask {
                source: Some(TaskSource::System),
                agent_id: Some(lead_id),
                creator_agent_id: Some(worker_id),
                task_type: Some("followup".to_string()),
                parent_task_id: Some(finished.id),
                external_context: finished.external_context.clone(),
                ..CreateTask::new(body)
            })
            .await?;
        Ok(Some(followup))
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped helpers
// ---------------------------------------------------------------------------

/// Insert a task inside the caller's transaction. The channel hub uses this
/// to promote mentions in the same transaction as the message write;
/// `enforce_capacity` is false there, since a chat-originated task must not
/// be dropped.
pub(crate) async fn create_in_conn(
    conn: &mut SqliteConnection,
    mut request: CreateTask,
    enforce_capacity: bool,
) -> EngineResult<Task> {
    if request.task.trim().is_empty() {
        return Err(EngineError::Validation(
            "task description is required".into(),
        ));
    }
    let priority = clamp_priority(request.priority.unwrap_or(50))?;
    let source = request.source.unwrap_or(TaskSource::Mcp);

    // Session affinity: a child task without an explicit assignee follows
    // its parent's current agent so the runtime can resume the parent's
    // session.
    if request.agent_id.is_none() {
        if let Some(parent_id) = request.parent_task_id {
            let parent = fetch_task(&mut *conn, parent_id).await?;
            request.agent_id = parent.agent_id;
        }
    }

    if let Some(epic_id) = request.epic_id {
        let epic_name: Option<String> = sqlx::query_scalar("SELECT name FROM epics WHERE id = ?1")
            .bind(epic_id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        let Some(epic_name) = epic_name else {
            return Err(EngineError::NotFound("epic", epic_id.to_string()));
        };
        let epic_tag = format!("epic:{}", epic_name);
        if !request.tags.contains(&epic_tag) {
            request.tags.push(epic_tag);
        }
    }

    let (status, agent_id, offered_to) = match (request.agent_id, request.offer_mode) {
        (Some(target), true) => (TaskStatus::Offered, None, Some(target)),
        (Some(target), false) => (TaskStatus::Pending, Some(target), None),
        (None, _) => (TaskStatus::Unassigned, None, None),
    };

    if let Some(target) = request.agent_id {
        let target_agent = fetch_agent(&mut *conn, target).await?;
        // Offers bypass the capacity bound; direct assignment does not.
        if enforce_capacity && !request.offer_mode {
            let active = agents::active_task_count(&mut *conn, target).await?;
            if active >= target_agent.max_tasks {
                return Err(EngineError::Conflict(format!(
                    "agent '{}' is at capacity ({}/{}) — use offerMode to propose the task",
                    target_agent.name, active, target_agent.max_tasks
                )));
            }
        }
    }

    let id = new_id();
    let now = Utc::now();
    let row = sqlx::query(&format!(
        "INSERT INTO agent_tasks (id, task, status, source, agent_id, creator_agent_id, \
                                  offered_to, offered_at, task_type, tags, priority, \
                                  depends_on, parent_task_id, epic_id, external_context, \
                                  created_at, last_updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16) \
         RETURNING {TASK_COLUMNS}"
    ))
    .bind(id.to_string())
    .bind(request.task.trim())
    .bind(status.to_string())
    .bind(source.to_string())
    .bind(agent_id.map(|v| v.to_string()))
    .bind(request.creator_agent_id.map(|v| v.to_string()))
    .bind(offered_to.map(|v| v.to_string()))
    .bind(offered_to.map(|_| now))
    .bind(&request.task_type)
    .bind(encode_list(&request.tags)?)
    .bind(priority)
    .bind(encode_list(&request.depends_on)?)
    .bind(request.parent_task_id.map(|v| v.to_string()))
    .bind(request.epic_id.map(|v| v.to_string()))
    .bind(
        request
            .external_context
            .as_ref()
            .filter(|ctx| !ctx.is_empty())
            .map(serde_json::to_string)
            .transpose()?,
    )
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    let task = Task::from_row(&row)?;

    events::record(
        &mut *conn,
        NewEvent::new(EventKind::TaskCreated)
            .maybe_agent(request.creator_agent_id)
            .task(task.id)
            .new_value(status.to_string())
            .metadata(json!({ "source": source.to_string() })),
    )
    .await?;
    if let Some(target) = offered_to {
        events::record(
            &mut *conn,
            NewEvent::new(EventKind::TaskOffered)
                .agent(target)
                .task(task.id),
        )
        .await?;
    }
    if let Some(assignee) = agent_id {
        agents::refresh_status_from_capacity(&mut *conn, assignee).await?;
    }

    Ok(task)
}

pub(crate) async fn fetch_task(conn: &mut SqliteConnection, id: Uuid) -> EngineResult<Task> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE id = ?1"
    ))
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?;
    match row {
        Some(row) => Ok(Task::from_row(&row)?),
        None => Err(EngineError::NotFound("task", id.to_string())),
    }
}

pub(crate) async fn fetch_agent(conn: &mut SqliteConnection, id: Uuid) -> EngineResult<Agent> {
    let row = sqlx::query(
        "SELECT id, name, is_lead, status, role, description, capabilities, max_tasks, \
                created_at, last_updated_at \
         FROM agents WHERE id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(conn)
    .await?;
    match row {
        Some(row) => Ok(Agent::from_row(&row)?),
        None => Err(EngineError::NotFound("agent", id.to_string())),
    }
}

/// SQLITE_BUSY (including the snapshot variant) reports "database is
/// locked"; any other database failure propagates untouched.
fn is_busy(err: &EngineError) -> bool {
    match err {
        EngineError::Database(sqlx::Error::Database(db)) => {
            db.message().contains("database is locked")
        }
        _ => false,
    }
}

async fn dependency_check(
    conn: &mut SqliteConnection,
    task: &Task,
) -> EngineResult<DependencyCheck> {
    let mut blocked_by = Vec::new();
    for dep_id in &task.depends_on {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM agent_tasks WHERE id = ?1")
                .bind(dep_id.to_string())
                .fetch_optional(&mut *conn)
                .await?;
        match status.as_deref() {
            Some("completed") => {}
            _ => blocked_by.push(*dep_id),
        }
    }
    Ok(DependencyCheck {
        ready: blocked_by.is_empty(),
        blocked_by,
    })
}
