//! Process Memory Telemetry
//!
//! Admission control and pressure reclamation both key off the resident
//! memory of the current process. The probe is a trait so tests (and
//! embedders with their own telemetry) can substitute a fixed reading.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

/// Source of the current process's resident memory usage
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of this process in bytes
    fn process_memory_bytes(&self) -> u64;
}

/// sysinfo-backed probe reading the current process's RSS
pub struct SystemMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot resolve current pid, memory checks disabled: {}", e);
                None
            }
        };
        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn process_memory_bytes(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|p| p.memory()).unwrap_or(0)
    }
}

/// Probe returning a fixed, settable value. Used by tests to drive the
/// pressure paths deterministically.
pub struct StaticMemoryProbe {
    bytes: AtomicU64,
}

impl StaticMemoryProbe {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemoryProbe for StaticMemoryProbe {
    fn process_memory_bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}
