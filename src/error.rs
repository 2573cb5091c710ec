//! Manager Error Taxonomy
//!
//! Everything a caller of the inbound command surface can get back.
//! Admission refusals, credential timeouts, authorization failures, and
//! not-found are distinct variants so callers can phrase distinct replies
//! ("try again later" vs "that session is not yours").

use thiserror::Error;

use crate::events::WaitError;
use crate::provider::ProviderError;
use crate::session::{AdmissionError, RegistryError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ManagerError {
    /// Capacity or memory pressure refusal, not retried automatically
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The provider failed to start (or re-start) a session
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("session not found: {0}")]
    NotFound(String),

    /// Owner mismatch on delete; distinct from not-found
    #[error("session {0} belongs to another owner")]
    Unauthorized(String),

    /// Bounded wait settled without a payload; `WaitError::Timeout` is the
    /// timeout-specific outcome callers can answer with "try again"
    #[error(transparent)]
    Wait(#[from] WaitError),
}

impl ManagerError {
    /// Whether this is the timeout outcome of a bounded wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Wait(WaitError::Timeout { .. }))
    }
}
