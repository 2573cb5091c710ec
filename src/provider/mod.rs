//! Connection Provider Boundary
//!
//! The external library that owns the wire protocol and session crypto is
//! consumed exclusively through these traits, so the rest of the manager
//! never depends on its shape. A provider starts a session rooted in a
//! per-session directory and reports lifecycle signals over a channel.

mod adapter;
#[cfg(test)]
pub mod mock;

pub use adapter::ProviderAdapter;

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::session::{ConnectionMetadata, ConnectionType};

/// Lifecycle signals raised by a provider session
#[derive(Debug, Clone)]
pub enum ProviderSignal {
    /// Scan code or pairing code became available
    CredentialReady(String),
    /// The session finished linking
    Connected(ConnectionMetadata),
    /// The session closed. `should_reconnect` distinguishes a transient
    /// drop from a fatal close (logout, credential revocation).
    Closed { should_reconnect: bool },
}

/// Provider boundary errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider session start failed: {0}")]
    StartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A freshly-started provider session: the controlling handle plus the
/// channel its lifecycle signals arrive on
pub struct ProviderSession {
    pub handle: Box<dyn ProviderHandle>,
    pub signals: mpsc::Receiver<ProviderSignal>,
}

/// Factory for provider sessions
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Start a session rooted at `dir`, linking via `connection_type`
    async fn start_session(
        &self,
        dir: &Path,
        connection_type: ConnectionType,
    ) -> Result<ProviderSession, ProviderError>;
}

/// Control handle over one open provider session.
///
/// `terminate` is the explicit close path; implementations are expected to
/// also close the underlying connection if the handle is dropped, so a
/// rejected handle can never leak a connection.
#[async_trait]
pub trait ProviderHandle: Send + Sync {
    /// Force-close the underlying connection. Idempotent.
    async fn terminate(&mut self);
}
