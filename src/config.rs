//! Manager Configuration
//!
//! Policy values for admission control, credential delivery, and cleanup.
//! Every value is environment-tunable (`SUBBOT_*` variables) and falls back
//! to the documented default when the variable is absent or unparsable.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::ConnectionType;

/// Policy configuration for the subbot manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Maximum sessions active at once across all owners
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum sessions active at once per owner
    #[serde(default = "default_max_per_owner")]
    pub max_per_owner: usize,

    /// Idle timeout before a session is reclaimed (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Interval between cleanup sweeps (seconds)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Memory budget per session (MB), used to derive the process-wide
    /// admission and reclamation ceilings
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,

    /// How long a scan code stays deliverable (seconds)
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// How long a pairing code stays deliverable (seconds)
    #[serde(default = "default_pairing_timeout_secs")]
    pub pairing_timeout_secs: u64,

    /// Root directory under which per-session provider directories live
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

fn default_max_sessions() -> usize {
    10
}

fn default_max_per_owner() -> usize {
    2
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_memory_budget_mb() -> u64 {
    512
}

fn default_scan_timeout_secs() -> u64 {
    30
}

fn default_pairing_timeout_secs() -> u64 {
    60
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            max_per_owner: default_max_per_owner(),
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            memory_budget_mb: default_memory_budget_mb(),
            scan_timeout_secs: default_scan_timeout_secs(),
            pairing_timeout_secs: default_pairing_timeout_secs(),
            session_dir: default_session_dir(),
        }
    }
}

impl ManagerConfig {
    /// Build a config from `SUBBOT_*` environment variables, falling back to
    /// defaults for anything unset
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("SUBBOT_MAX_SESSIONS") {
            config.max_sessions = v;
        }
        if let Some(v) = env_parse("SUBBOT_MAX_PER_OWNER") {
            config.max_per_owner = v;
        }
        if let Some(v) = env_parse("SUBBOT_IDLE_TIMEOUT_SECS") {
            config.idle_timeout_secs = v;
        }
        if let Some(v) = env_parse("SUBBOT_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval_secs = v;
        }
        if let Some(v) = env_parse("SUBBOT_MEMORY_BUDGET_MB") {
            config.memory_budget_mb = v;
        }
        if let Some(v) = env_parse("SUBBOT_SCAN_TIMEOUT_SECS") {
            config.scan_timeout_secs = v;
        }
        if let Some(v) = env_parse("SUBBOT_PAIRING_TIMEOUT_SECS") {
            config.pairing_timeout_secs = v;
        }
        if let Ok(dir) = std::env::var("SUBBOT_SESSION_DIR") {
            if !dir.is_empty() {
                config.session_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Credential delivery window for a connection type
    pub fn credential_timeout(&self, connection_type: ConnectionType) -> Duration {
        match connection_type {
            ConnectionType::Scan => Duration::from_secs(self.scan_timeout_secs),
            ConnectionType::Pairing => Duration::from_secs(self.pairing_timeout_secs),
        }
    }

    /// Total memory budget across all session slots (bytes)
    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_mb * 1024 * 1024 * self.max_sessions as u64
    }

    /// Admission ceiling: new sessions are refused above this.
    /// Sits below the reclamation ceiling so cleanup has room to act.
    pub fn memory_soft_limit_bytes(&self) -> u64 {
        (self.memory_budget_bytes() as f64 * 0.8) as u64
    }

    /// Reclamation ceiling: the cleanup sweep starts sacrificing live
    /// sessions above this
    pub fn memory_hard_limit_bytes(&self) -> u64 {
        (self.memory_budget_bytes() as f64 * 0.9) as u64
    }
}

/// Parse an env var, warning (not failing) on garbage values
fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}
