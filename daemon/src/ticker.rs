//! The scheduler's timer loop — the only internal timer-driven actor in
//! the process. On shutdown the current tick is drained before returning.
use chrono::Utc;
use std::time::Duration;
use swarm_core::Engine;
use tokio::sync::watch;

pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_secs(5);

pub async fn run(engine: Engine, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let scheduler = engine.scheduler();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(period_secs = period.as_secs_f64(), "scheduler loop started");
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scheduler.tick(Utc::now()).await {
                    Ok(outcome) => {
                        if !outcome.materialized.is_empty() {
                            tracing::info!(
                                count = outcome.materialized.len(),
                                "materialized scheduled tasks"
                            );
                        }
                        for name in &outcome.disabled {
                            tracing::warn!(schedule = %name, "schedule disabled during tick");
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "scheduler tick failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("scheduler loop stopping");
                    break;
                }
            }
        }
    }
}
