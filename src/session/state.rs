//! Session Status State Machine
//!
//! Status transitions are monotonic within a session's lifetime, with one
//! exception: the single reconnect attempt after a non-fatal close, which
//! moves an active session back to `pending` under the same code. Terminal
//! states are never left; reclaimed sessions get a fresh code instead of
//! being revived.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record exists, provider session not started yet
    Pending,
    /// Provider started, waiting for the user to scan the code
    WaitingScan,
    /// Provider started, waiting for the user to enter the pairing code
    WaitingPairing,
    /// Linked and exchanging traffic
    Connected,
    /// Closed explicitly or by a fatal provider close
    Disconnected,
    /// Reclaimed by the cleanup sweep (idle or memory pressure)
    Inactive,
    /// Failed; kept for diagnostics
    Error,
}

/// Invalid status transition
#[derive(Debug, Error)]
#[error("invalid session status transition: {from} -> {to}")]
pub struct StateError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}

impl SessionStatus {
    /// Active statuses count against global and per-owner capacity
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Pending | Self::WaitingScan | Self::WaitingPairing | Self::Connected
        )
    }

    /// Terminal statuses are never left
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Inactive | Self::Error)
    }

    /// Validate and apply a transition
    pub fn transition(self, to: SessionStatus) -> Result<SessionStatus, StateError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(StateError { from: self, to })
        }
    }

    fn can_transition(self, to: SessionStatus) -> bool {
        match to {
            // Provider start
            Self::WaitingScan | Self::WaitingPairing => self == Self::Pending,
            // Linked
            Self::Connected => matches!(self, Self::WaitingScan | Self::WaitingPairing),
            // The single reconnect attempt: active states fall back to
            // pending under the same code
            Self::Pending => self.is_active(),
            // Any non-terminal state can be closed or fail
            Self::Disconnected | Self::Inactive | Self::Error => !self.is_terminal(),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::WaitingScan => "waiting_scan",
            Self::WaitingPairing => "waiting_pairing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Inactive => "inactive",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}
