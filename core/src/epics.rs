/// Epics: large bodies of work that own tasks by back-reference. Progress
/// is derived from the owned tasks, never stored.
use crate::errors::{EngineError, EngineResult};
use crate::model::{clamp_priority, encode_json, encode_list, Agent, Epic, EpicProgress, EpicStatus, Task};
use crate::store::{new_id, SqliteStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

const EPIC_COLUMNS: &str = "id, name, goal, description, prd, plan, status, priority, tags, \
                            lead_agent_id, created_by_agent_id, channel_id, external_refs, \
                            created_at, started_at, completed_at";

const TASK_COLUMNS: &str = "id, task, status, source, agent_id, creator_agent_id, offered_to, \
                            offered_at, accepted_at, rejection_reason, task_type, tags, priority, \
                            depends_on, parent_task_id, epic_id, external_context, created_at, \
                            last_updated_at, finished_at, output, failure_reason, progress";

/// Parameters for creating an epic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEpic {
    pub name: String,
    pub goal: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prd: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lead_agent_id: Option<Uuid>,
    #[serde(default)]
    pub created_by_agent_id: Option<Uuid>,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
    #[serde(default)]
    pub external_refs: Option<serde_json::Value>,
}

/// Partial update; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEpic {
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub prd: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub status: Option<EpicStatus>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub lead_agent_id: Option<Uuid>,
}

/// An epic with its derived progress and owned tasks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicDetails {
    #[serde(flatten)]
    pub epic: Epic,
    pub progress: EpicProgress,
    pub tasks: Vec<Task>,
}

pub struct EpicRegistry {
    store: SqliteStore,
}

impl EpicRegistry {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: CreateEpic) -> EngineResult<Epic> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(EngineError::Validation("epic name is required".into()));
        }
        if request.goal.trim().is_empty() {
            return Err(EngineError::Validation("epic goal is required".into()));
        }
        let priority = clamp_priority(request.priority.unwrap_or(50))?;

        let taken: Option<String> = sqlx::query_scalar("SELECT id FROM epics WHERE name = ?1")
            .bind(name)
            .fetch_optional(self.store.pool())
            .await?;
        if taken.is_some() {
            return Err(EngineError::Conflict(format!(
                "an epic named '{}' already exists",
                name
            )));
        }

        let row = sqlx::query(&format!(
            "INSERT INTO epics (id, name, goal, description, prd, plan, status, priority, tags, \
                                lead_agent_id, created_by_agent_id, channel_id, external_refs, \
                                created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) \
             RETURNING {EPIC_COLUMNS}"
        ))
        .bind(new_id().to_string())
        .bind(name)
        .bind(request.goal.trim())
        .bind(&request.description)
        .bind(&request.prd)
        .bind(&request.plan)
        .bind(EpicStatus::Draft.to_string())
        .bind(priority)
        .bind(encode_list(&request.tags)?)
        .bind(request.lead_agent_id.map(|v| v.to_string()))
        .bind(request.created_by_agent_id.map(|v| v.to_string()))
        .bind(request.channel_id.map(|v| v.to_string()))
        .bind(encode_json(&request.external_refs.unwrap_or(serde_json::Value::Null))?)
        .bind(Utc::now())
        .fetch_one(self.store.pool())
        .await?;
        Ok(Epic::from_row(&row)?)
    }

    pub async fn get(&self, id: Uuid) -> EngineResult<Epic> {
        let row = sqlx::query(&format!("SELECT {EPIC_COLUMNS} FROM epics WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;
        match row {
            Some(row) => Ok(Epic::from_row(&row)?),
            None => Err(EngineError::NotFound("epic", id.to_string())),
        }
    }

    pub async fn list(&self) -> EngineResult<Vec<Epic>> {
        let rows = sqlx::query(&format!(
            "SELECT {EPIC_COLUMNS} FROM epics ORDER BY priority DESC, created_at ASC"
        ))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter()
            .map(|row| Epic::from_row(row).map_err(Into::into))
            .collect()
    }

    pub async fn progress(&self, id: Uuid) -> EngineResult<EpicProgress> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, \
                    SUM(status = 'completed') AS completed, \
                    SUM(status = 'in_progress') AS in_progress, \
                    SUM(status = 'failed') AS failed \
             FROM agent_tasks WHERE epic_id = ?1",
        )
        .bind(id.to_string())
        .fetch_one(self.store.pool())
        .await?;
        Ok(EpicProgress {
            total: row.try_get("total")?,
            completed: row.try_get::<Option<i64>, _>("completed")?.unwrap_or(0),
            in_progress: row.try_get::<Option<i64>, _>("in_progress")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }

    pub async fn details(&self, id: Uuid) -> EngineResult<EpicDetails> {
        let epic = self.get(id).await?;
        let progress = self.progress(id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM agent_tasks WHERE epic_id = ?1 \
             ORDER BY priority DESC, last_updated_at DESC"
        ))
        .bind(id.to_string())
        .fetch_all(self.store.pool())
        .await?;
        let tasks = rows
            .iter()
            .map(Task::from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EpicDetails {
            epic,
            progress,
            tasks,
        })
    }

    /// Update an epic. Lead-or-creator only. Entering `active` stamps
    /// `started_at` once; entering a terminal status stamps `completed_at`.
    pub async fn update(
        &self,
        id: Uuid,
        caller: &Agent,
        update: UpdateEpic,
    ) -> EngineResult<Epic> {
        let current = self.get(id).await?;
        authorize(caller, &current)?;
        if let Some(priority) = update.priority {
            clamp_priority(priority)?;
        }

        let status = update.status.unwrap_or(current.status);
        let started_at = match (current.started_at, status) {
            (None, EpicStatus::Active) => Some(Utc::now()),
            (existing, _) => existing,
        };
        let completed_at = if status.is_terminal() {
            current.completed_at.or_else(|| Some(Utc::now()))
        } else {
            None
        };

        let row = sqlx::query(&format!(
            "UPDATE epics SET goal = ?2, description = ?3, prd = ?4, plan = ?5, status = ?6, \
                              priority = ?7, tags = ?8, lead_agent_id = ?9, started_at = ?10, \
                              completed_at = ?11 \
             WHERE id = ?1 RETURNING {EPIC_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.goal.unwrap_or(current.goal))
        .bind(update.description.or(current.description))
        .bind(update.prd.or(current.prd))
        .bind(update.plan.or(current.plan))
        .bind(status.to_string())
        .bind(update.priority.unwrap_or(current.priority))
        .bind(encode_list(update.tags.as_deref().unwrap_or(&current.tags))?)
        .bind(
            update
                .lead_agent_id
                .or(current.lead_agent_id)
                .map(|v| v.to_string()),
        )
        .bind(started_at)
        .bind(completed_at)
        .fetch_one(self.store.pool())
        .await?;
        Ok(Epic::from_row(&row)?)
    }

    /// Delete an epic, detaching its tasks (the tasks themselves survive).
    pub async fn delete(&self, id: Uuid, caller: &Agent) -> EngineResult<()> {
        let epic = self.get(id).await?;
        authorize(caller, &epic)?;

        let mut tx = self.store.begin().await?;
        detach_tasks(&mut tx, &epic).await?;
        sqlx::query("DELETE FROM epics WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Attach a task, maintaining the derived `epic:<name>` tag.
    pub async fn assign_task(&self, epic_id: Uuid, task_id: Uuid) -> EngineResult<Task> {
        let epic = self.get(epic_id).await?;

        let mut tx = self.store.begin().await?;
        let task = crate::tasks::fetch_task(&mut tx, task_id).await?;

        let epic_tag = format!("epic:{}", epic.name);
        let mut tags: Vec<String> = task
            .tags
            .iter()
            .filter(|t| !t.starts_with("epic:"))
            .cloned()
            .collect();
        tags.push(epic_tag);

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET epic_id = ?2, tags = ?3, last_updated_at = ?4 \
             WHERE id = ?1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(epic_id.to_string())
        .bind(encode_list(&tags)?)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let task = Task::from_row(&row)?;
        tx.commit().await?;
        Ok(task)
    }

    /// Detach a task from whatever epic owns it.
    pub async fn unassign_task(&self, task_id: Uuid) -> EngineResult<Task> {
        let mut tx = self.store.begin().await?;
        let task = crate::tasks::fetch_task(&mut tx, task_id).await?;
        if task.epic_id.is_none() {
            return Err(EngineError::InvalidState(
                "task is not assigned to an epic".into(),
            ));
        }

        let tags: Vec<String> = task
            .tags
            .iter()
            .filter(|t| !t.starts_with("epic:"))
            .cloned()
            .collect();

        let row = sqlx::query(&format!(
            "UPDATE agent_tasks SET epic_id = NULL, tags = ?2, last_updated_at = ?3 \
             WHERE id = ?1 RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.to_string())
        .bind(encode_list(&tags)?)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;
        let task = Task::from_row(&row)?;
        tx.commit().await?;
        Ok(task)
    }
}

fn authorize(caller: &Agent, epic: &Epic) -> EngineResult<()> {
    if caller.is_lead || epic.created_by_agent_id == Some(caller.id) {
        Ok(())
    } else {
        Err(EngineError::Unauthorized(
            "only the lead or the epic's creator may modify it".into(),
        ))
    }
}

async fn detach_tasks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    epic: &Epic,
) -> EngineResult<()> {
    let epic_tag = format!("epic:{}", epic.name);
    let rows = sqlx::query("SELECT id, tags FROM agent_tasks WHERE epic_id = ?1")
        .bind(epic.id.to_string())
        .fetch_all(&mut **tx)
        .await?;
    for row in &rows {
        let id: String = row.try_get("id")?;
        let tags: Option<String> = row.try_get("tags")?;
        let tags: Vec<String> = tags
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        let tags: Vec<String> = tags.into_iter().filter(|t| t != &epic_tag).collect();
        sqlx::query("UPDATE agent_tasks SET epic_id = NULL, tags = ?2 WHERE id = ?1")
            .bind(&id)
            .bind(encode_list(&tags)?)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentRegistry, JoinRequest};
    use crate::model::TaskStatus;
    use crate::tasks::{CreateTask, TaskEngine};

    struct Fixture {
        epics: EpicRegistry,
        engine: TaskEngine,
        registry: AgentRegistry,
    }

    async fn fixture() -> Fixture {
        let store = SqliteStore::open_in_memory().await.unwrap();
        Fixture {
            epics: EpicRegistry::new(store.clone()),
            engine: TaskEngine::new(store.clone()),
            registry: AgentRegistry::new(store),
        }
    }

    fn launch_epic() -> CreateEpic {
        CreateEpic {
            name: "launch".to_string(),
            goal: "ship v1".to_string(),
            description: None,
            prd: None,
            plan: None,
            priority: None,
            tags: vec![],
            lead_agent_id: None,
            created_by_agent_id: None,
            channel_id: None,
            external_refs: None,
        }
    }

    #[tokio::test]
    async fn create_starts_in_draft_with_unique_name() {
        let fx = fixture().await;
        let epic = fx.epics.create(launch_epic()).await.unwrap();
        assert_eq!(epic.status, EpicStatus::Draft);
        assert!(epic.started_at.is_none());

        let err = fx.epics.create(launch_epic()).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn activation_and_completion_stamp_timestamps_once() {
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
        let epic = fx.epics.create(launch_epic()).await.unwrap();

        let active = fx
            .epics
            .update(
                epic.id,
                &lead,
                UpdateEpic {
                    status: Some(EpicStatus::Active),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let started = active.started_at.unwrap();

        let paused = fx
            .epics
            .update(
                epic.id,
                &lead,
                UpdateEpic {
                    status: Some(EpicStatus::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(paused.started_at, Some(started));

        let done = fx
            .epics
            .update(
                epic.id,
                &lead,
                UpdateEpic {
                    status: Some(EpicStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(done.started_at, Some(started));
    }

    #[tokio::test]
    async fn assign_and_unassign_maintain_the_epic_tag() {
        let fx = fixture().await;
        let epic = fx.epics.create(launch_epic()).await.unwrap();
        let task = fx
            .engine
            .create(CreateTask {
                tags: vec!["backend".to_string()],
                ..CreateTask::new("auth flow")
            })
            .await
            .unwrap();

        let assigned = fx.epics.assign_task(epic.id, task.id).await.unwrap();
        assert_eq!(assigned.epic_id, Some(epic.id));
        assert!(assigned.tags.contains(&"backend".to_string()));
        assert!(assigned.tags.contains(&"epic:launch".to_string()));

        let unassigned = fx.epics.unassign_task(task.id).await.unwrap();
        assert!(unassigned.epic_id.is_none());
        assert!(unassigned.tags.contains(&"backend".to_string()));
        assert!(!unassigned.tags.iter().any(|t| t.starts_with("epic:")));

        let err = fx.epics.unassign_task(task.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn progress_is_derived_from_owned_tasks() {
        let fx = fixture().await;
        let worker = fx
            .registry
            .join(JoinRequest {
                name: "w1".to_string(),
                max_tasks: Some(5),
                ..Default::default()
            })
            .await
            .unwrap();
        let epic = fx.epics.create(launch_epic()).await.unwrap();

        let t1 = fx
            .engine
            .create(CreateTask {
                epic_id: Some(epic.id),
                ..CreateTask::new("t1")
            })
            .await
            .unwrap();
        let t2 = fx
            .engine
            .create(CreateTask {
                epic_id: Some(epic.id),
                ..CreateTask::new("t2")
            })
            .await
            .unwrap();

        fx.engine.claim(t1.id, worker.id).await.unwrap();
        fx.engine.complete(t1.id, worker.id, None).await.unwrap();
        fx.engine.claim(t2.id, worker.id).await.unwrap();
        fx.engine.start(t2.id, worker.id).await.unwrap();

        let progress = fx.epics.progress(epic.id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.failed, 0);

        let details = fx.epics.details(epic.id).await.unwrap();
        assert_eq!(details.tasks.len(), 2);
        assert_eq!(details.epic.name, "launch");
    }

    #[tokio::test]
    async fn delete_detaches_tasks_but_keeps_them() {
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
        let epic = fx.epics.create(launch_epic()).await.unwrap();
        let task = fx
            .engine
            .create(CreateTask {
                epic_id: Some(epic.id),
                ..CreateTask::new("survives")
            })
            .await
            .unwrap();

        fx.epics.delete(epic.id, &lead).await.unwrap();

        let task = fx.engine.get(task.id).await.unwrap();
        assert!(task.epic_id.is_none());
        assert!(!task.tags.iter().any(|t| t.starts_with("epic:")));
        assert_eq!(task.status, TaskStatus::Unassigned);
    }

    #[tokio::test]
    async fn updates_are_lead_or_creator_only() {
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
        let epic = fx
            .epics
            .create(CreateEpic {
                created_by_agent_id: Some(creator.id),
                ..launch_epic()
            })
            .await
            .unwrap();

        assert!(matches!(
            fx.epics
                .update(epic.id, &stranger, UpdateEpic::default())
                .await
                .unwrap_err(),
            EngineError::Unauthorized(_)
        ));
        fx.epics
            .update(epic.id, &creator, UpdateEpic::default())
            .await
            .unwrap();
    }
}
