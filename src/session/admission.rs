//! Admission Control
//!
//! Decides whether a new session may be created, before any resources are
//! allocated. Pure read over registry counts and process memory telemetry;
//! safe to call concurrently with creation and reclamation. The registry
//! re-validates capacity under its create lock, so a stale admission answer
//! can never overshoot the caps.

use std::sync::Arc;

use thiserror::Error;

use super::registry::SessionRegistry;
use crate::config::ManagerConfig;
use crate::memory::MemoryProbe;

/// Why a new session was refused
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("global session capacity reached ({current}/{max} active)")]
    GlobalCapacity { current: usize, max: usize },

    #[error("you already have {current} of {max} allowed sessions")]
    OwnerCapacity { current: usize, max: usize },

    #[error("server under memory pressure ({used_mb} MB used, ceiling {limit_mb} MB), try again later")]
    MemoryPressure { used_mb: u64, limit_mb: u64 },
}

pub struct AdmissionController {
    registry: Arc<SessionRegistry>,
    memory: Arc<dyn MemoryProbe>,
    config: ManagerConfig,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        memory: Arc<dyn MemoryProbe>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            memory,
            config,
        }
    }

    /// Evaluate whether `owner_id` may create a session right now
    pub fn check(&self, owner_id: &str) -> Result<(), AdmissionError> {
        let active = self.registry.active_count();
        if active >= self.config.max_sessions {
            return Err(AdmissionError::GlobalCapacity {
                current: active,
                max: self.config.max_sessions,
            });
        }

        let owner_active = self.registry.active_count_for_owner(owner_id);
        if owner_active >= self.config.max_per_owner {
            return Err(AdmissionError::OwnerCapacity {
                current: owner_active,
                max: self.config.max_per_owner,
            });
        }

        // Soft ceiling below the reclamation ceiling, so cleanup has room
        // to act before the process is actually exhausted
        let used = self.memory.process_memory_bytes();
        let limit = self.config.memory_soft_limit_bytes();
        if used > limit {
            return Err(AdmissionError::MemoryPressure {
                used_mb: used / (1024 * 1024),
                limit_mb: limit / (1024 * 1024),
            });
        }

        Ok(())
    }
}
