//! Session Types and Data Structures

use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::state::SessionStatus;
use crate::provider::ProviderHandle;

/// How the session is linked to the end user's primary account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Scan code displayed to the user
    Scan,
    /// Numeric pairing code entered on the primary device
    Pairing,
}

impl ConnectionType {
    /// The waiting status entered once the provider session starts
    pub fn waiting_status(self) -> SessionStatus {
        match self {
            Self::Scan => SessionStatus::WaitingScan,
            Self::Pairing => SessionStatus::WaitingPairing,
        }
    }
}

impl std::fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Scan => "scan",
            Self::Pairing => "pairing",
        })
    }
}

/// Metadata the provider reports once a session links
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionMetadata {
    /// Provider-side account identifier (e.g. the linked phone number)
    pub remote_id: Option<String>,
    /// Display name of the linked account
    pub display_name: Option<String>,
}

/// Durable record of one session, keyed by `code`.
///
/// Timestamps are milliseconds since the Unix epoch. `credential` holds the
/// opaque scan/pairing payload while it is deliverable and is cleared when
/// the session reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub code: String,
    pub owner_id: String,
    pub connection_type: ConnectionType,
    pub status: SessionStatus,
    #[serde(default)]
    pub credential: Option<String>,
    pub created_at: i64,
    pub last_activity_at: i64,
    #[serde(default)]
    pub connected_at: Option<i64>,
    #[serde(default)]
    pub disconnected_at: Option<i64>,
    #[serde(default)]
    pub message_count: u64,
}

impl SessionRecord {
    pub fn new(
        code: impl Into<String>,
        owner_id: impl Into<String>,
        connection_type: ConnectionType,
    ) -> Self {
        let now = now_ms();
        Self {
            code: code.into(),
            owner_id: owner_id.into(),
            connection_type,
            status: SessionStatus::Pending,
            credential: None,
            created_at: now,
            last_activity_at: now,
            connected_at: None,
            disconnected_at: None,
            message_count: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// An in-memory session entry owned by the registry. Never persisted; its
/// presence means a connection attempt for the code is currently open.
pub struct SessionEntry {
    /// Live copy of the durable record
    pub record: SessionRecord,
    /// Handle to the open provider session, attached after start
    pub handle: Option<Box<dyn ProviderHandle>>,
    /// Monotonic last-activity clock for idle reclamation
    pub last_activity: Instant,
    /// Whether the one permitted reconnect attempt has been consumed
    pub reconnect_attempted: bool,
}

impl SessionEntry {
    pub fn new(record: SessionRecord) -> Self {
        Self {
            record,
            handle: None,
            last_activity: Instant::now(),
            reconnect_attempted: false,
        }
    }
}

/// Current millisecond timestamp
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
