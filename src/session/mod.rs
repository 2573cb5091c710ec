//! Session Lifecycle Management
//!
//! Provides the session registry and the policies around it:
//! - Status state machine for the session lifecycle
//! - Thread-safe registry with capacity-checked creation
//! - Admission control (capacity + memory pressure)
//! - Background cleanup: idle and pressure reclamation

mod admission;
mod cleanup;
mod registry;
mod state;
mod types;

pub use admission::{AdmissionController, AdmissionError};
pub use cleanup::{CleanupHandle, CleanupScheduler, SweepSummary};
pub use registry::{RegistryError, RegistryStats, SessionRegistry};
pub use state::{SessionStatus, StateError};
pub use types::{ConnectionMetadata, ConnectionType, SessionEntry, SessionRecord};
