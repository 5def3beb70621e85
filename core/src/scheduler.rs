/// Scheduler: persistent templates that materialize tasks on a cron or
/// interval cadence.
///
/// The daemon owns the timer loop; everything here is transactional logic
/// driven by `tick`. Each due schedule is processed in its own transaction,
/// so one failing schedule never stalls the rest.
use crate::errors::{EngineError, EngineResult};
use crate::events::{self, EventKind, NewEvent};
use crate::model::{clamp_priority, encode_list, Agent, ScheduledTask, Task, TaskSource};
use crate::store::{new_id, SqliteStore};
use crate::tasks::{self, CreateTask};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use uuid::Uuid;

const SCHEDULE_COLUMNS: &str = "id, name, description, task_template, task_type, tags, priority, \
                                target_agent_id, cron_expression, interval_ms, timezone, enabled, \
                                last_run_at, next_run_at, created_by_agent_id, created_at, \
                                last_updated_at";

/// Parameters for creating a schedule. Exactly one of `cron_expression` /
/// `interval_ms` must be set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSchedule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub task_template: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub target_agent_id: Option<Uuid>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_by_agent_id: Option<Uuid>,
}

fn default_enabled() -> bool {
    true
}

/// Partial update. `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSchedule {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub task_template: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub target_agent_id: Option<Uuid>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Outcome of one tick, for the daemon's logging.
#[derive(Debug, Default)]
pub struct TickOutcome {
    pub materialized: Vec<Task>,
    pub disabled: Vec<String>,
}

pub struct Scheduler {
    store: SqliteStore,
}

impl Scheduler {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: CreateSchedule) -> EngineResult<ScheduledTask> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("schedule name is required".into()));
        }
        if request.task_template.trim().is_empty() {
            return Err(EngineError::Validation("taskTemplate is required".into()));
        }
        let priority = clamp_priority(request.priority.unwrap_or(50))?;
        validate_cadence(request.cron_expression.as_deref(), request.interval_ms)?;
        let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());

        let taken: Option<String> =
            sqlx::query_scalar("SELECT id FROM scheduled_tasks WHERE name = ?1")
                .bind(name)
                .fetch_optional(self.store.pool())
                .await?;
        if taken.is_some() {
            return Err(EngineError::Conflict(format!(
                "a schedule named '{}' already exists",
                name
            )));
        }

        let now = Utc::now();
        let next_run_at = if request.enabled {
            Some(compute_next_run(
                request.cron_expression.as_deref(),
                request.interval_ms,
                &timezone,
                now,
            )?)
        } else {
            None
        };

        let row = sqlx::query(&format!(
            "INSERT INTO scheduled_tasks (id, name, description, task_template, task_type, tags, \
                                          priority, target_agent_id, cron_expression, interval_ms, \
                                          timezone, enabled, next_run_at, created_by_agent_id, \
                                          created_at, last_updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15) \
             RETURNING {SCHEDULE_COLUMNS}"
        ))
        .bind(new_id().to_string())
        .bind(name)
        .bind(&request.description)
        .bind(request.task_template.trim())
        .bind(&request.task_type)
        .bind(encode_list(&request.tags)?)
        .bind(priority)
        .bind(request.target_agent_id.map(|v| v.to_string()))
        .bind(&request.cron_expression)
        .bind(request.interval_ms)
        .bind(&timezone)
        .bind(request.enabled)
        .bind(next_run_at)
        .bind(request.created_by_agent_id.map(|v| v.to_string()))
        .bind(now)
        .fetch_one(self.store.pool())
        .await?;
        Ok(ScheduledTask::from_row(&row)?)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<ScheduledTask> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks WHERE id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(self.store.pool())
        .await?;
        match row {
            Some(row) => Ok(ScheduledTask::from_row(&row)?),
            None => Err(EngineError::NotFound("schedule", id.to_string())),
        }
    }

    pub async fn list(&self) -> EngineResult<Vec<ScheduledTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks ORDER BY created_at ASC"
        ))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| ScheduledTask::from_row(row).map_err(Into::into))
            .collect()
    }

    /// Update a schedule. Only its creator or a lead may do so. Disabling
    /// clears `next_run_at`; re-enabling (or changing the cadence) recomputes
    /// it from now.
    pub async fn update(
        &self,
        id: Uuid,
        caller: &Agent,
        update: UpdateSchedule,
    ) -> EngineResult<ScheduledTask> {
        let current = self.get(id).await?;
        authorize(caller, &current)?;

        if let Some(priority) = update.priority {
            clamp_priority(priority)?;
        }

        let cron_expression = match &update.cron_expression {
            Some(expr) => Some(expr.clone()),
            None => current.cron_expression.clone(),
        };
        // Switching to a cron cadence clears the interval, and vice versa.
        let (cron_expression, interval_ms) = match (&update.cron_expression, update.interval_ms) {
            (Some(_), None) => (cron_expression, None),
            (None, Some(ms)) => (None, Some(ms)),
            (Some(_), Some(_)) => {
                return Err(EngineError::Validation(
                    "set either cronExpression or intervalMs, not both".into(),
                ));
            }
            (None, None) => (cron_expression, current.interval_ms),
        };
        validate_cadence(cron_expression.as_deref(), interval_ms)?;

        let timezone = update.timezone.unwrap_or_else(|| current.timezone.clone());
        let enabled = update.enabled.unwrap_or(current.enabled);
        let cadence_changed = update.cron_expression.is_some()
            || update.interval_ms.is_some()
            || timezone != current.timezone;

        let now = Utc::now();
        let next_run_at = if !enabled {
            None
        } else if cadence_changed || !current.enabled {
            Some(compute_next_run(
                cron_expression.as_deref(),
                interval_ms,
                &timezone,
                now,
            )?)
        } else {
            current.next_run_at
        };

        let row = sqlx::query(&format!(
            "UPDATE scheduled_tasks SET description = ?2, task_template = ?3, task_type = ?4, \
                                        tags = ?5, priority = ?6, target_agent_id = ?7, \
                                        cron_expression = ?8, interval_ms = ?9, timezone = ?10, \
                                        enabled = ?11, next_run_at = ?12, last_updated_at = ?13 \
             WHERE id = ?1 RETURNING {SCHEDULE_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.description.or(current.description))
        .bind(update.task_template.unwrap_or(current.task_template))
        .bind(update.task_type.or(current.task_type))
        .bind(encode_list(update.tags.as_deref().unwrap_or(&current.tags))?)
        .bind(update.priority.unwrap_or(current.priority))
        .bind(
            update
                .target_agent_id
                .or(current.target_agent_id)
                .map(|v| v.to_string()),
        )
        .bind(&cron_expression)
        .bind(interval_ms)
        .bind(&timezone)
        .bind(enabled)
        .bind(next_run_at)
        .bind(now)
        .fetch_one(self.store.pool())
        .await?;
        Ok(ScheduledTask::from_row(&row)?)
    }

    pub async fn delete(&self, id: Uuid, caller: &Agent) -> EngineResult<()> {
        let current = self.get(id).await?;
        authorize(caller, &current)?;
        sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?1")
            .bind(id.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Materialize once, immediately. Sets `last_run_at` but leaves
    /// `next_run_at` untouched.
    pub async fn run_now(&self, id: Uuid, caller: &Agent) -> EngineResult<Task> {
        let schedule = self.get(id).await?;
        authorize(caller, &schedule)?;

        let mut tx = self.store.begin().await?;
        let task = materialize(&mut tx, &schedule).await?;
        sqlx::query("UPDATE scheduled_tasks SET last_run_at = ?2, last_updated_at = ?2 WHERE id = ?1")
            .bind(id.to_string())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;
        events::record(
            &mut tx,
            NewEvent::new(EventKind::ScheduleTriggered)
                .maybe_agent(schedule.created_by_agent_id)
                .task(task.id)
                .new_value(&schedule.name)
                .metadata(json!({ "manual": true })),
        )
        .await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Process every enabled schedule whose `next_run_at` has passed. One
    /// transaction per schedule. A cron expression that no longer parses
    /// disables its schedule and materializes nothing.
    pub async fn tick(&self, now: DateTime<Utc>) -> EngineResult<TickOutcome> {
        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM scheduled_tasks \
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
             ORDER BY next_run_at ASC"
        ))
        .bind(now)
        .fetch_all(self.store.pool())
        .await?;

        let mut outcome = TickOutcome::default();
        for row in &rows {
            let schedule = ScheduledTask::from_row(row)?;

            let next_run = compute_next_run(
                schedule.cron_expression.as_deref(),
                schedule.interval_ms,
                &schedule.timezone,
                now,
            );
            let next_run = match next_run {
                Ok(next) => next,
                Err(err) => {
                    self.disable_broken(&schedule, &err).await?;
                    outcome.disabled.push(schedule.name.clone());
                    continue;
                }
            };

            let mut tx = self.store.begin().await?;
            let task = materialize(&mut tx, &schedule).await?;
            sqlx::query(
                "UPDATE scheduled_tasks SET last_run_at = ?2, next_run_at = ?3, \
                                            last_updated_at = ?2 \
                 WHERE id = ?1",
            )
            .bind(schedule.id.to_string())
            .bind(now)
            .bind(next_run)
            .execute(&mut *tx)
            .await?;
            events::record(
                &mut tx,
                NewEvent::new(EventKind::ScheduleTriggered)
                    .maybe_agent(schedule.created_by_agent_id)
                    .task(task.id)
                    .new_value(&schedule.name),
            )
            .await?;
            tx.commit().await?;

            tracing::debug!(schedule = %schedule.name, task = %task.id, "schedule fired");
            outcome.materialized.push(task);
        }
        Ok(outcome)
    }

    async fn disable_broken(&self, schedule: &ScheduledTask, err: &EngineError) -> EngineResult<()> {
        let mut tx = self.store.begin().await?;
        sqlx::query(
            "UPDATE scheduled_tasks SET enabled = 0, next_run_at = NULL, last_updated_at = ?2 \
             WHERE id = ?1",
        )
        .bind(schedule.id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        events::record(
            &mut tx,
            NewEvent::new(EventKind::ScheduleDisabled)
                .maybe_agent(schedule.created_by_agent_id)
                .new_value(&schedule.name)
                .metadata(json!({ "error": err.to_string() })),
        )
        .await?;
        tx.commit().await?;
        tracing::warn!(schedule = %schedule.name, error = %err, "disabled schedule with unparseable cadence");
        Ok(())
    }
}

fn authorize(caller: &Agent, schedule: &ScheduledTask) -> EngineResult<()> {
    if caller.is_lead || schedule.created_by_agent_id == Some(caller.id) {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "only the schedule's creator or a lead may modify it".into(),
        ))
    }
}

fn validate_cadence(cron_expression: Option<&str>, interval_ms: Option<i64>) -> EngineResult<()> {
    match (cron_expression, interval_ms) {
        (Some(expr), None) => {
            parse_cron(expr)?;
            Ok(())
        }
        (None, Some(ms)) if ms > 0 => Ok(()),
        (None, Some(_)) => Err(EngineError::Validation(
            "intervalMs must be positive".into(),
        )),
        (None, None) => Err(EngineError::Validation(
            "one of cronExpression or intervalMs is required".into(),
        )),
        (Some(_), Some(_)) => Err(EngineError::Validation(
            "set either cronExpression or intervalMs, not both".into(),
        )),
    }
}

/// Parse a cron expression, accepting the common five-field form by
/// prepending a seconds column.
fn parse_cron(expression: &str) -> EngineResult<CronSchedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    CronSchedule::from_str(&normalized)
        .map_err(|e| EngineError::Validation(format!("malformed cron expression: {}", e)))
}

/// Next fire time after `now`. Timezone strings are arbitrary IANA names;
/// unknown ones fall back to UTC.
fn compute_next_run(
    cron_expression: Option<&str>,
    interval_ms: Option<i64>,
    timezone: &str,
    now: DateTime<Utc>,
) -> EngineResult<DateTime<Utc>> {
    if let Some(expression) = cron_expression {
        let schedule = parse_cron(expression)?;
        let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        let next = schedule
            .after(&now.with_timezone(&tz))
            .next()
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "cron expression '{}' has no future occurrence",
                    expression
                ))
            })?;
        return Ok(next.with_timezone(&Utc));
    }
    let interval_ms = interval_ms.ok_or_else(|| {
        EngineError::Validation("one of cronExpression or intervalMs is required".into())
    })?;
    Ok(now + Duration::milliseconds(interval_ms))
}

/// Build a task from the schedule's template inside the caller's
/// transaction. A target agent gets the task directly; otherwise it joins
/// the unassigned pool.
async fn materialize(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    schedule: &ScheduledTask,
) -> EngineResult<Task> {
    tasks::create_in_conn(
        tx,
        CreateTask {
            source: Some(TaskSource::System),
            agent_id: schedule.target_agent_id,
            creator_agent_id: schedule.created_by_agent_id,
            task_type: schedule.task_type.clone(),
            tags: schedule.tags.clone(),
            priority: Some(schedule.priority),
            ..CreateTask::new(schedule.task_template.clone())
        },
        false,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistry, JoinRequest};
    use crate::events::{EventFilter, EventLog};
    use crate::model::TaskStatus;
    use crate::tasks::{TaskEngine, TaskFilter};

    struct Fixture {
        store: SqliteStore,
        scheduler: Scheduler,
        registry: AgentRegistry,
        engine: TaskEngine,
    }

    async fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Fixture {
            scheduler: Scheduler::new(store.clone()),
            registry: AgentRegistry::new(store.clone()),
            engine: TaskEngine::new(store.clone()),
            store,
        }
    }

    fn digest_schedule(name: &str) -> CreateSchedule {
        CreateSchedule {
            name: name.to_string(),
            description: None,
            task_template: "daily digest".to_string(),
            task_type: Some("digest".to_string()),
            tags: vec!["recurring".to_string()],
            priority: Some(40),
            target_agent_id: None,
            cron_expression: None,
            interval_ms: Some(60_000),
            timezone: None,
            enabled: true,
            created_by_agent_id: None,
        }
    }

    #[tokio::test]
    async fn create_computes_next_run_for_intervals() {
        let fx = fixture().await;
        let before = Utc::now();
        let schedule = fx.scheduler.create(digest_schedule("digest")).await.unwrap();
        let next = schedule.next_run_at.unwrap();
        assert!(next >= before + Duration::milliseconds(60_000));
        assert!(next <= Utc::now() + Duration::milliseconds(60_000));
        assert_eq!(schedule.timezone, "UTC");
    }

    #[tokio::test]
    async fn exactly_one_cadence_is_required() {
        let fx = fixture().await;
        let err = fx
            .scheduler
            .create(CreateSchedule {
                interval_ms: None,
                ..digest_schedule("none")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = fx
            .scheduler
            .create(CreateSchedule {
                cron_expression: Some("0 9 * * *".to_string()),
                ..digest_schedule("both")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn malformed_cron_is_rejected_at_creation() {
        let fx = fixture().await;
        let err = fx
            .scheduler
            .create(CreateSchedule {
                interval_ms: None,
                cron_expression: Some("not a cron".to_string()),
                ..digest_schedule("bad")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn five_field_cron_expressions_are_accepted() {
        let fx = fixture().await;
        let schedule = fx
            .scheduler
            .create(CreateSchedule {
                interval_ms: None,
                cron_expression: Some("0 9 * * *".to_string()),
                timezone: Some("America/New_York".to_string()),
                ..digest_schedule("morning")
            })
            .await
            .unwrap();
        assert!(schedule.next_run_at.is_some());
    }

    #[tokio::test]
    async fn tick_materializes_due_schedules_once() {
        let fx = fixture().await;
        let w1 = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let schedule = fx
            .scheduler
            .create(CreateSchedule {
                target_agent_id: Some(w1.id),
                ..digest_schedule("digest")
            })
            .await
            .unwrap();

        // Not yet due.
        let outcome = fx.scheduler.tick(Utc::now()).await.unwrap();
        assert!(outcome.materialized.is_empty());

        // Advance past next_run_at.
        let later = schedule.next_run_at.unwrap() + Duration::seconds(1);
        let outcome = fx.scheduler.tick(later).await.unwrap();
        assert_eq!(outcome.materialized.len(), 1);

        let task = &outcome.materialized[0];
        assert_eq!(task.task, "daily digest");
        assert_eq!(task.agent_id, Some(w1.id));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.source, crate::model::TaskSource::System);
        assert_eq!(task.priority, 40);
        assert!(task.tags.contains(&"recurring".to_string()));

        let updated = fx.scheduler.get(schedule.id).await.unwrap();
        assert_eq!(updated.last_run_at, Some(later));
        assert_eq!(
            updated.next_run_at,
            Some(later + Duration::milliseconds(60_000))
        );

        let log = EventLog::new(fx.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("schedule_triggered".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);

        // The same tick time fires nothing further.
        let outcome = fx.scheduler.tick(later).await.unwrap();
        assert!(outcome.materialized.is_empty());
    }

    #[tokio::test]
    async fn broken_cron_disables_schedule_without_materializing() {
        let fx = fixture().await;
        let schedule = fx.scheduler.create(digest_schedule("digest")).await.unwrap();

        // Corrupt the stored expression to simulate dialect drift.
        sqlx::query(
            "UPDATE scheduled_tasks SET cron_expression = 'garbage', interval_ms = NULL \
             WHERE id = ?1",
        )
        .bind(schedule.id.to_string())
        .execute(fx.store.pool())
        .await
        .unwrap();

        let later = schedule.next_run_at.unwrap() + Duration::seconds(1);
        let outcome = fx.scheduler.tick(later).await.unwrap();
        assert!(outcome.materialized.is_empty());
        assert_eq!(outcome.disabled, vec!["digest".to_string()]);

        let updated = fx.scheduler.get(schedule.id).await.unwrap();
        assert!(!updated.enabled);
        assert!(updated.next_run_at.is_none());

        let tasks = fx.engine.list(TaskFilter::default()).await.unwrap();
        assert!(tasks.is_empty());

        let log = EventLog::new(fx.store.clone());
        let events = log
            .list(EventFilter {
                event_type: Some("schedule_disabled".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn run_now_does_not_touch_next_run() {
        let fx = fixture().await;
        let lead = fx
            .registry
            .join(JoinRequest {
                name: "lead".to_string(),
                lead: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let schedule = fx.scheduler.create(digest_schedule("digest")).await.unwrap();
        let next_before = schedule.next_run_at;

        let task = fx.scheduler.run_now(schedule.id, &lead).await.unwrap();
        assert_eq!(task.task, "daily digest");

        let updated = fx.scheduler.get(schedule.id).await.unwrap();
        assert!(updated.last_run_at.is_some());
        assert_eq!(updated.next_run_at, next_before);
    }

    #[tokio::test]
    async fn disable_clears_and_reenable_recomputes_next_run() {
        let fx = fixture().await;
        let lead = fx
            .registry
            .join(JoinRequest {
                name: "lead".to_string(),
                lead: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let schedule = fx.scheduler.create(digest_schedule("digest")).await.unwrap();

        let disabled = fx
            .scheduler
            .update(
                schedule.id,
                &lead,
                UpdateSchedule {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!disabled.enabled);
        assert!(disabled.next_run_at.is_none());

        let before = Utc::now();
        let enabled = fx
            .scheduler
            .update(
                schedule.id,
                &lead,
                UpdateSchedule {
                    enabled: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(enabled.enabled);
        assert!(enabled.next_run_at.unwrap() >= before);
    }

    #[tokio::test]
    async fn only_creator_or_lead_may_modify() {
        let fx = fixture().await;
        let creator = fx
            .registry
            .join(JoinRequest {
                name: "creator".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let stranger = fx
            .registry
            .join(JoinRequest {
                name: "stranger".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let schedule = fx
            .scheduler
            .create(CreateSchedule {
                created_by_agent_id: Some(creator.id),
                ..digest_schedule("digest")
            })
            .await
            .unwrap();

        assert!(matches!(
            fx.scheduler
                .update(schedule.id, &stranger, UpdateSchedule::default())
                .await
                .unwrap_err(),
            EngineError::Unauthorized(_)
        ));
        assert!(matches!(
            fx.scheduler.run_now(schedule.id, &stranger).await.unwrap_err(),
            EngineError::Unauthorized(_)
        ));
        assert!(matches!(
            fx.scheduler.delete(schedule.id, &stranger).await.unwrap_err(),
            EngineError::Unauthorized(_)
        ));

        fx.scheduler
            .update(schedule.id, &creator, UpdateSchedule::default())
            .await
            .unwrap();
        fx.scheduler.delete(schedule.id, &creator).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_timezone_falls_back_to_utc() {
        let next = compute_next_run(Some("0 0 12 * * *"), None, "Mars/Olympus", Utc::now()).unwrap();
        assert!(next > Utc::now());
    }
}
