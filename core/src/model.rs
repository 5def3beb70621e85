/// Entity definitions for the swarm coordination engine.
///
/// Every entity is owned by the store; these structs are row images, not
/// live handles. Status fields are tagged sums with exhaustive matching so
/// the task state machine stays a function over the sum.
use crate::errors::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Fixed id of the seeded `general` channel.
pub const GENERAL_CHANNEL_ID: Uuid = Uuid::from_u128(0x6765_6e65_7261_6c00_0000_0000_0000_0001);

/// First eight hex characters of an id, used for UI linkbacks.
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

/// An agent in the swarm: a worker or the single lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub is_lead: bool,
    pub status: AgentStatus,
    pub role: Option<String>,
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub max_tasks: i64,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Unassigned,
    Offered,
    Pending,
    InProgress,
    Paused,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are sticky: `finished_at` is set once and the row
    /// never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Active states count against the owning agent's capacity.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::InProgress)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Unassigned => "unassigned",
            TaskStatus::Offered => "offered",
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Paused => "paused",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "unassigned" => Ok(TaskStatus::Unassigned),
            "offered" => Ok(TaskStatus::Offered),
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "paused" => Ok(TaskStatus::Paused),
            "reviewing" => Ok(TaskStatus::Reviewing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    Mcp,
    Slack,
    Api,
    System,
}

impl std::fmt::Display for TaskSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskSource::Mcp => write!(f, "mcp"),
            TaskSource::Slack => write!(f, "slack"),
            TaskSource::Api => write!(f, "api"),
            TaskSource::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for TaskSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mcp" => Ok(TaskSource::Mcp),
            "slack" => Ok(TaskSource::Slack),
            "api" => Ok(TaskSource::Api),
            "system" => Ok(TaskSource::System),
            _ => Err(format!("Invalid task source: {}", s)),
        }
    }
}

/// External chat context carried by a task so worker replies can be routed
/// back to the originating thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

impl ExternalContext {
    pub fn is_empty(&self) -> bool {
        self.channel_id.is_none()
            && self.thread_ref.is_none()
            && self.user_id.is_none()
            && self.repo.is_none()
    }
}

/// A unit of work in the swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: Uuid,
    pub task: String,
    pub status: TaskStatus,
    pub source: TaskSource,
    pub agent_id: Option<Uuid>,
    pub creator_agent_id: Option<Uuid>,
    pub offered_to: Option<Uuid>,
    pub offered_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub priority: i64,
    pub depends_on: Vec<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub epic_id: Option<Uuid>,
    pub external_context: Option<ExternalContext>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub failure_reason: Option<String>,
    pub progress: Option<String>,
}

/// Channel visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Public,
    Dm,
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelType::Public => write!(f, "public"),
            ChannelType::Dm => write!(f, "dm"),
        }
    }
}

impl std::str::FromStr for ChannelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(ChannelType::Public),
            "dm" => Ok(ChannelType::Dm),
            _ => Err(format!("Invalid channel type: {}", s)),
        }
    }
}

/// A chat channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub channel_type: ChannelType,
    pub created_by: Option<Uuid>,
    /// Participant set, only meaningful for DM channels.
    pub participants: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A message posted to a channel. `agent_id = None` means a human posted
/// through the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub content: String,
    pub reply_to_id: Option<Uuid>,
    pub mentions: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Per-agent, per-channel high-water mark for reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReadState {
    pub agent_id: Uuid,
    pub channel_id: Uuid,
    pub last_read_at: DateTime<Utc>,
}

/// Health status of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Stopped,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Unhealthy => write!(f, "unhealthy"),
            ServiceStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for ServiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(ServiceStatus::Starting),
            "healthy" => Ok(ServiceStatus::Healthy),
            "unhealthy" => Ok(ServiceStatus::Unhealthy),
            "stopped" => Ok(ServiceStatus::Stopped),
            _ => Err(format!("Invalid service status: {}", s)),
        }
    }
}

/// A self-reported long-running process owned by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub port: i64,
    pub url: Option<String>,
    pub health_check_path: String,
    pub status: ServiceStatus,
    pub script: String,
    pub cwd: Option<String>,
    pub interpreter: Option<String>,
    pub args: Option<String>,
    pub env: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Owner name, denormalized into listings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// A persistent template producing tasks on a cron or interval cadence.
/// Exactly one of `cron_expression` / `interval_ms` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub task_template: String,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
    pub priority: i64,
    pub target_agent_id: Option<Uuid>,
    pub cron_expression: Option<String>,
    pub interval_ms: Option<i64>,
    pub timezone: String,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_by_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// Status of an epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpicStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl EpicStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpicStatus::Completed | EpicStatus::Cancelled)
    }
}

impl std::fmt::Display for EpicStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EpicStatus::Draft => write!(f, "draft"),
            EpicStatus::Active => write!(f, "active"),
            EpicStatus::Paused => write!(f, "paused"),
            EpicStatus::Completed => write!(f, "completed"),
            EpicStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for EpicStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(EpicStatus::Draft),
            "active" => Ok(EpicStatus::Active),
            "paused" => Ok(EpicStatus::Paused),
            "completed" => Ok(EpicStatus::Completed),
            "cancelled" => Ok(EpicStatus::Cancelled),
            _ => Err(format!("Invalid epic status: {}", s)),
        }
    }
}

/// A large body of work owning tasks by back-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epic {
    pub id: Uuid,
    pub name: String,
    pub goal: String,
    pub description: Option<String>,
    pub prd: Option<String>,
    pub plan: Option<String>,
    pub status: EpicStatus,
    pub priority: i64,
    pub tags: Vec<String>,
    pub lead_agent_id: Option<Uuid>,
    pub created_by_agent_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub external_refs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Derived task counts for an epic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpicProgress {
    pub total: i64,
    pub completed: i64,
    pub in_progress: i64,
    pub failed: i64,
}

/// An append-only lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: Uuid,
    pub event_type: String,
    pub agent_id: Option<Uuid>,
    pub task_id: Option<Uuid>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An externally-originated message queued for the lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub content: String,
    pub slack_channel_id: Option<String>,
    pub slack_thread_ts: Option<String>,
    pub slack_user_id: Option<String>,
    pub delegated_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Row parsing
// ---------------------------------------------------------------------------

fn parse_uuid(value: &str) -> Result<Uuid, sqlx::Error> {
    Uuid::parse_str(value).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn get_uuid(row: &SqliteRow, column: &str) -> Result<Uuid, sqlx::Error> {
    let value: String = row.try_get(column)?;
    parse_uuid(&value)
}

fn get_opt_uuid(row: &SqliteRow, column: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    value.as_deref().map(parse_uuid).transpose()
}

fn get_status<T: std::str::FromStr<Err = String>>(
    row: &SqliteRow,
    column: &str,
) -> Result<T, sqlx::Error> {
    let value: String = row.try_get(column)?;
    value
        .parse()
        .map_err(|e: String| sqlx::Error::Decode(e.into()))
}

/// Decode a JSON array column of strings; NULL decodes to an empty list.
fn get_string_list(row: &SqliteRow, column: &str) -> Result<Vec<String>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    match value {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e))),
        None => Ok(Vec::new()),
    }
}

/// Decode a JSON array column of ids; NULL decodes to an empty list.
fn get_uuid_list(row: &SqliteRow, column: &str) -> Result<Vec<Uuid>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    match value {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e))),
        None => Ok(Vec::new()),
    }
}

fn get_json(row: &SqliteRow, column: &str) -> Result<serde_json::Value, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    match value {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| sqlx::Error::Decode(Box::new(e))),
        None => Ok(serde_json::Value::Null),
    }
}

/// Serialize a list field for storage. Empty lists store as NULL so legacy
/// rows and fresh rows read back the same way.
pub(crate) fn encode_list<T: Serialize>(items: &[T]) -> EngineResult<Option<String>> {
    if items.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(items)?))
    }
}

pub(crate) fn encode_json(value: &serde_json::Value) -> EngineResult<Option<String>> {
    if value.is_null() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(value)?))
    }
}

impl Agent {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Agent {
            id: get_uuid(row, "id")?,
            name: row.try_get("name")?,
            is_lead: row.try_get("is_lead")?,
            status: get_status(row, "status")?,
            role: row.try_get("role")?,
            description: row.try_get("description")?,
            capabilities: get_string_list(row, "capabilities")?,
            max_tasks: row.try_get("max_tasks")?,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }
}

impl Task {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let external_context: Option<String> = row.try_get("external_context")?;
        let external_context = external_context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Task {
            id: get_uuid(row, "id")?,
            task: row.try_get("task")?,
            status: get_status(row, "status")?,
            source: get_status(row, "source")?,
            agent_id: get_opt_uuid(row, "agent_id")?,
            creator_agent_id: get_opt_uuid(row, "creator_agent_id")?,
            offered_to: get_opt_uuid(row, "offered_to")?,
            offered_at: row.try_get("offered_at")?,
            accepted_at: row.try_get("accepted_at")?,
            rejection_reason: row.try_get("rejection_reason")?,
            task_type: row.try_get("task_type")?,
            tags: get_string_list(row, "tags")?,
            priority: row.try_get("priority")?,
            depends_on: get_uuid_list(row, "depends_on")?,
            parent_task_id: get_opt_uuid(row, "parent_task_id")?,
            epic_id: get_opt_uuid(row, "epic_id")?,
            external_context,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
            finished_at: row.try_get("finished_at")?,
            output: row.try_get("output")?,
            failure_reason: row.try_get("failure_reason")?,
            progress: row.try_get("progress")?,
        })
    }
}

impl Channel {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Channel {
            id: get_uuid(row, "id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            channel_type: get_status(row, "channel_type")?,
            created_by: get_opt_uuid(row, "created_by")?,
            participants: get_uuid_list(row, "participants")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl ChannelMessage {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ChannelMessage {
            id: get_uuid(row, "id")?,
            channel_id: get_uuid(row, "channel_id")?,
            agent_id: get_opt_uuid(row, "agent_id")?,
            content: row.try_get("content")?,
            reply_to_id: get_opt_uuid(row, "reply_to_id")?,
            mentions: get_uuid_list(row, "mentions")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl Service {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let env: Option<String> = row.try_get("env")?;
        let env = env
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Service {
            id: get_uuid(row, "id")?,
            agent_id: get_uuid(row, "agent_id")?,
            name: row.try_get("name")?,
            port: row.try_get("port")?,
            url: row.try_get("url")?,
            health_check_path: row.try_get("health_check_path")?,
            status: get_status(row, "status")?,
            script: row.try_get("script")?,
            cwd: row.try_get("cwd")?,
            interpreter: row.try_get("interpreter")?,
            args: row.try_get("args")?,
            env,
            metadata: get_json(row, "metadata")?,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
            agent_name: row.try_get("agent_name").ok(),
        })
    }
}

impl ScheduledTask {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(ScheduledTask {
            id: get_uuid(row, "id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            task_template: row.try_get("task_template")?,
            task_type: row.try_get("task_type")?,
            tags: get_string_list(row, "tags")?,
            priority: row.try_get("priority")?,
            target_agent_id: get_opt_uuid(row, "target_agent_id")?,
            cron_expression: row.try_get("cron_expression")?,
            interval_ms: row.try_get("interval_ms")?,
            timezone: row.try_get("timezone")?,
            enabled: row.try_get("enabled")?,
            last_run_at: row.try_get("last_run_at")?,
            next_run_at: row.try_get("next_run_at")?,
            created_by_agent_id: get_opt_uuid(row, "created_by_agent_id")?,
            created_at: row.try_get("created_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }
}

impl Epic {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Epic {
            id: get_uuid(row, "id")?,
            name: row.try_get("name")?,
            goal: row.try_get("goal")?,
            description: row.try_get("description")?,
            prd: row.try_get("prd")?,
            plan: row.try_get("plan")?,
            status: get_status(row, "status")?,
            priority: row.try_get("priority")?,
            tags: get_string_list(row, "tags")?,
            lead_agent_id: get_opt_uuid(row, "lead_agent_id")?,
            created_by_agent_id: get_opt_uuid(row, "created_by_agent_id")?,
            channel_id: get_opt_uuid(row, "channel_id")?,
            external_refs: get_json(row, "external_refs")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl EventLogEntry {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(EventLogEntry {
            id: get_uuid(row, "id")?,
            event_type: row.try_get("event_type")?,
            agent_id: get_opt_uuid(row, "agent_id")?,
            task_id: get_opt_uuid(row, "task_id")?,
            old_value: row.try_get("old_value")?,
            new_value: row.try_get("new_value")?,
            metadata: get_json(row, "metadata")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl InboxMessage {
    pub fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(InboxMessage {
            id: get_uuid(row, "id")?,
            agent_id: get_uuid(row, "agent_id")?,
            content: row.try_get("content")?,
            slack_channel_id: row.try_get("slack_channel_id")?,
            slack_thread_ts: row.try_get("slack_thread_ts")?,
            slack_user_id: row.try_get("slack_user_id")?,
            delegated_task_id: get_opt_uuid(row, "delegated_task_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Clamp a priority into the [0, 100] range the dashboard expects.
pub fn clamp_priority(priority: i64) -> EngineResult<i64> {
    if !(0..=100).contains(&priority) {
        return Err(EngineError::Validation(format!(
            "priority must be between 0 and 100, got {}",
            priority
        )));
    }
    Ok(priority)
}

/// Truncate to `max` characters on a char boundary, appending an ellipsis
/// marker when anything was cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}…", cut)
}
