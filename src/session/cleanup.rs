//! Cleanup Scheduler
//!
//! Recurring background sweep with two cooperating policies:
//! - Idle reclamation: sessions quiet past the inactivity timeout are
//!   closed and persisted as `inactive`.
//! - Pressure reclamation: if the process is still over the hard memory
//!   ceiling after the idle pass, the oldest-activity 30% of live sessions
//!   are sacrificed, idle or not. Under pressure the process wins over any
//!   individual session.
//!
//! Per-session failures are logged and swallowed; the sweep loop never
//! dies to a single bad session.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::state::SessionStatus;
use crate::config::ManagerConfig;
use crate::events::EventBus;
use crate::memory::MemoryProbe;

/// What one sweep reclaimed
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub idle_reclaimed: usize,
    pub pressure_reclaimed: usize,
    pub failures: usize,
}

impl SweepSummary {
    pub fn total_reclaimed(&self) -> usize {
        self.idle_reclaimed + self.pressure_reclaimed
    }
}

pub struct CleanupScheduler {
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
    memory: Arc<dyn MemoryProbe>,
    config: ManagerConfig,
}

impl CleanupScheduler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<EventBus>,
        memory: Arc<dyn MemoryProbe>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            memory,
            config,
        }
    }

    /// Run the sweep loop on the configured interval until shut down
    pub fn spawn(self: Arc<Self>) -> CleanupHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = self.config.cleanup_interval();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first sweep waits a full period
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.sweep_once().await;
                        if summary.total_reclaimed() > 0 || summary.failures > 0 {
                            info!(
                                "Cleanup sweep: {} idle, {} under pressure, {} failures",
                                summary.idle_reclaimed,
                                summary.pressure_reclaimed,
                                summary.failures
                            );
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("Cleanup scheduler stopped");
                        break;
                    }
                }
            }
        });

        CleanupHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    /// One full sweep: idle pass, then pressure pass. Public so tests and
    /// operator tooling can force a sweep outside the interval.
    pub async fn sweep_once(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();
        let idle_timeout = self.config.idle_timeout();

        for (code, last_activity) in self.registry.activity_snapshot() {
            let idle = last_activity.elapsed();
            if idle < idle_timeout {
                continue;
            }
            match self.registry.remove(&code, SessionStatus::Inactive).await {
                Ok(true) => {
                    info!("Reclaimed idle session {} (idle {:?})", code, idle);
                    self.bus.purge(&code);
                    summary.idle_reclaimed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to reclaim idle session {}: {}", code, e);
                    summary.failures += 1;
                }
            }
        }

        let used = self.memory.process_memory_bytes();
        let ceiling = self.config.memory_hard_limit_bytes();
        if used > ceiling {
            summary = self.pressure_pass(used, ceiling, summary).await;
        }

        summary
    }

    /// Reclaim the oldest-activity 30% (rounded up, minimum 1) of live
    /// sessions, regardless of idleness
    async fn pressure_pass(
        &self,
        used: u64,
        ceiling: u64,
        mut summary: SweepSummary,
    ) -> SweepSummary {
        let mut remaining = self.registry.activity_snapshot();
        if remaining.is_empty() {
            return summary;
        }
        remaining.sort_by_key(|(_, last_activity)| *last_activity);

        let victim_count = ((remaining.len() as f64) * 0.3).ceil() as usize;
        let victim_count = victim_count.clamp(1, remaining.len());
        warn!(
            "Memory pressure: {} MB used over {} MB ceiling, sacrificing {} of {} sessions",
            used / (1024 * 1024),
            ceiling / (1024 * 1024),
            victim_count,
            remaining.len()
        );

        for (code, _) in remaining.into_iter().take(victim_count) {
            match self.registry.remove(&code, SessionStatus::Inactive).await {
                Ok(true) => {
                    info!("Reclaimed session {} under memory pressure", code);
                    self.bus.purge(&code);
                    summary.pressure_reclaimed += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to reclaim session {} under pressure: {}", code, e);
                    summary.failures += 1;
                }
            }
        }
        summary
    }
}

/// Owner of the spawned sweep loop. Dropping the handle aborts the loop,
/// so the scheduler never outlives the manager that spawned it.
pub struct CleanupHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stop the loop and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for CleanupHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
