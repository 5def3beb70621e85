//! Seam toward the external chat bridge.
//!
//! Outcome notifications are fired after the owning transaction commits and
//! are strictly best-effort: a failed push is logged and never surfaces to
//! the agent that finished the task.
use async_trait::async_trait;
use std::sync::Arc;
use swarm_core::{short_id, Task};

#[async_trait]
pub trait BridgeNotifier: Send + Sync {
    /// Push a worker outcome back toward the external chat thread the task
    /// originated from.
    async fn notify_outcome(&self, task: &Task) -> anyhow::Result<()>;
}

/// Default notifier when no bridge is configured: log and move on.
pub struct LoggingBridge;

#[async_trait]
impl BridgeNotifier for LoggingBridge {
    async fn notify_outcome(&self, task: &Task) -> anyhow::Result<()> {
        tracing::info!(
            task = %short_id(&task.id),
            status = %task.status,
            "outcome ready for chat bridge (no bridge configured)"
        );
        Ok(())
    }
}

/// Fire-and-forget dispatch, used after commit.
pub fn notify_detached(bridge: Arc<dyn BridgeNotifier>, task: Task) {
    tokio::spawn(async move {
        if let Err(err) = bridge.notify_outcome(&task).await {
            tracing::warn!(task = %short_id(&task.id), error = %err, "chat bridge push failed");
        }
    });
}
