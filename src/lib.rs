//! Subbot Manager
//!
//! Lifecycle manager for secondary messaging sessions ("subbots"):
//! - Session registry with concurrent connection limiting
//! - Admission control (global capacity, per-owner capacity, memory pressure)
//! - Typed event bus keyed by session code and signal kind
//! - Bounded-wait credential delivery (scan codes and pairing codes)
//! - Background cleanup: idle reclamation and pressure-triggered reclamation
//! - Durable session records via a pluggable store (redb + MessagePack)
//!
//! The external connection provider (the library that actually speaks the
//! messaging wire protocol) is consumed through the [`provider`] boundary
//! traits; everything else in this crate is provider-agnostic.

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod memory;
pub mod provider;
pub mod session;
pub mod store;

pub use config::ManagerConfig;
pub use error::ManagerError;
pub use events::{await_signal, EventBus, SignalKind, SignalPayload, Subscription, WaitError};
pub use manager::{CreatedSession, SubbotManager};
pub use memory::{MemoryProbe, StaticMemoryProbe, SystemMemoryProbe};
pub use provider::{
    ConnectionProvider, ProviderAdapter, ProviderError, ProviderHandle, ProviderSession,
    ProviderSignal,
};
pub use session::{
    AdmissionController, AdmissionError, CleanupHandle, CleanupScheduler, ConnectionMetadata,
    ConnectionType, RegistryError, RegistryStats, SessionRecord, SessionRegistry, SessionStatus,
    StateError, SweepSummary,
};
pub use store::{MemorySessionStore, RedbSessionStore, SessionStore, StoreError};
