// Swarm: coordination engine for a fleet of autonomous coding agents.
// Core library providing the store, task state machine, channels, services,
// scheduler, and inbox over a single SQLite database.

pub mod agents;
pub mod channels;
pub mod config;
pub mod epics;
pub mod errors;
pub mod events;
pub mod inbox;
pub mod model;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod tasks;

// Re-export commonly used types
pub use errors::{EngineError, EngineResult};

pub use model::{
    short_id, truncate, Agent, AgentStatus, Channel, ChannelMessage, ChannelReadState, ChannelType,
    Epic, EpicProgress, EpicStatus, EventLogEntry, ExternalContext, InboxMessage, ScheduledTask,
    Service, ServiceStatus, Task, TaskSource, TaskStatus, GENERAL_CHANNEL_ID,
};

pub use store::SqliteStore;

pub use agents::{AgentRegistry, JoinRequest, ProfileUpdate};

pub use tasks::{CreateTask, DependencyCheck, TaskEngine, TaskFilter, TaskStatistics};

pub use channels::{
    AnnotatedMessage, ChannelHub, CreateChannel, MentionQuery, MessageWindow, PostMessage,
    PostedMessage, ReadMessagesOptions,
};

pub use services::{ServiceFilter, ServiceRegistry, UpsertService};

pub use scheduler::{CreateSchedule, Scheduler, TickOutcome, UpdateSchedule};

pub use inbox::{DelegateOptions, Inbox, InboxPush, InboxSummary, MentionPreview};

pub use epics::{CreateEpic, EpicDetails, EpicRegistry, UpdateEpic};

pub use events::{EventFilter, EventKind, EventLog, NewEvent};

pub use config::{Capability, CapabilitySet, EngineConfig};

/// Everything the daemon wires together: one store, one set of engine
/// facades over it.
#[derive(Clone)]
pub struct Engine {
    store: SqliteStore,
}

impl Engine {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn agents(&self) -> AgentRegistry {
        AgentRegistry::new(self.store.clone())
    }

    pub fn tasks(&self) -> TaskEngine {
        TaskEngine::new(self.store.clone())
    }

    pub fn channels(&self) -> ChannelHub {
        ChannelHub::new(self.store.clone())
    }

    pub fn services(&self) -> ServiceRegistry {
        ServiceRegistry::new(self.store.clone())
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.store.clone())
    }

    pub fn inbox(&self) -> Inbox {
        Inbox::new(self.store.clone())
    }

    pub fn epics(&self) -> EpicRegistry {
        EpicRegistry::new(self.store.clone())
    }

    pub fn events(&self) -> EventLog {
        EventLog::new(self.store.clone())
    }
}
