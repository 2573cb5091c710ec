//! Session Registry
//!
//! Authoritative in-memory index of live sessions, keyed by session code.
//! Thread-safe via DashMap; every durable transition is written through to
//! the session store synchronously so the store never runs ahead of what
//! actually happened.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::state::{SessionStatus, StateError};
use super::types::{now_ms, ConnectionType, SessionEntry, SessionRecord};
use crate::provider::ProviderHandle;
use crate::store::{SessionStore, StoreError};

/// Registry operation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session capacity reached: {current}/{max} active")]
    CapacityReached { current: usize, max: usize },

    #[error("owner {owner} at session capacity: {current}/{max} active")]
    OwnerCapacityReached {
        owner: String,
        current: usize,
        max: usize,
    },

    #[error("session {0} already has a live handle")]
    HandleAlreadyAttached(String),

    #[error(transparent)]
    StateTransition(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Registry snapshot for operators
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub max_per_owner: usize,
}

impl std::fmt::Display for RegistryStats {
    /// Renders as a single JSON object, ready for log lines and status
    /// endpoints
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&json)
    }
}

/// In-memory index of live sessions, backed by a durable session store
pub struct SessionRegistry {
    /// Map of session code to live entry
    sessions: DashMap<String, SessionEntry>,
    /// Durable records, written synchronously on every transition
    store: Arc<dyn SessionStore>,
    /// Active session count (pending/waiting/connected) - O(1)
    active_count: AtomicUsize,
    /// Maximum concurrently active sessions
    max_sessions: usize,
    /// Maximum concurrently active sessions per owner
    max_per_owner: usize,
    /// Lock for create to prevent TOCTOU race between count check and insert
    create_lock: parking_lot::Mutex<()>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, max_sessions: usize, max_per_owner: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            active_count: AtomicUsize::new(0),
            max_sessions,
            max_per_owner,
            create_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Mint a new session record in `pending` status and return its code.
    ///
    /// Capacity is re-validated under the create lock: the caller's earlier
    /// admission check may be stale by the time it gets here.
    pub fn create(
        &self,
        owner_id: &str,
        connection_type: ConnectionType,
    ) -> Result<String, RegistryError> {
        // Hold lock to make the count check atomic with the insert
        let _guard = self.create_lock.lock();

        let active = self.active_count();
        if active >= self.max_sessions {
            return Err(RegistryError::CapacityReached {
                current: active,
                max: self.max_sessions,
            });
        }

        let owner_active = self.active_count_for_owner(owner_id);
        if owner_active >= self.max_per_owner {
            return Err(RegistryError::OwnerCapacityReached {
                owner: owner_id.to_string(),
                current: owner_active,
                max: self.max_per_owner,
            });
        }

        let code = uuid::Uuid::new_v4().to_string();
        let record = SessionRecord::new(code.clone(), owner_id, connection_type);

        self.store.upsert(&record)?;
        self.sessions.insert(code.clone(), SessionEntry::new(record));
        self.active_count.fetch_add(1, Ordering::SeqCst);

        info!(
            "Created session {} for owner {} ({})",
            code, owner_id, connection_type
        );
        Ok(code)
    }

    /// Bind a live provider handle to a session. A session must never have
    /// two concurrent live handles, so a second attach is an error.
    pub fn attach(
        &self,
        code: &str,
        handle: Box<dyn ProviderHandle>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| RegistryError::SessionNotFound(code.to_string()))?;

        if entry.handle.is_some() {
            return Err(RegistryError::HandleAlreadyAttached(code.to_string()));
        }
        entry.handle = Some(handle);
        debug!("Session {} handle attached", code);
        Ok(())
    }

    /// Take the live handle off a session without closing the session.
    /// Used by the reconnect path to retire the old handle before re-start.
    pub fn detach_handle(&self, code: &str) -> Option<Box<dyn ProviderHandle>> {
        self.sessions.get_mut(code).and_then(|mut e| e.handle.take())
    }

    /// Consume the single permitted reconnect attempt. Returns false if the
    /// session is gone or the attempt was already spent.
    pub fn try_mark_reconnect(&self, code: &str) -> bool {
        match self.sessions.get_mut(code) {
            Some(mut entry) if !entry.reconnect_attempted => {
                entry.reconnect_attempted = true;
                true
            }
            _ => false,
        }
    }

    /// Record inbound traffic: bump the message counter and refresh
    /// last-activity on both the entry and the durable record
    pub fn touch(&self, code: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| RegistryError::SessionNotFound(code.to_string()))?;

        entry.last_activity = Instant::now();
        entry.record.last_activity_at = now_ms();
        entry.record.message_count = self.store.increment_messages(code, 1)?;
        self.store.upsert(&entry.record)?;
        Ok(())
    }

    /// Apply a status transition, maintaining timestamps, the credential
    /// payload, and the active count, then persist the record
    pub fn update_status(&self, code: &str, to: SessionStatus) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| RegistryError::SessionNotFound(code.to_string()))?;

        let from = entry.record.status;
        let next = from.transition(to)?;
        let was_active = from.is_active();

        entry.record.status = next;
        match next {
            SessionStatus::Connected => {
                entry.record.connected_at = Some(now_ms());
                entry.record.last_activity_at = now_ms();
                entry.last_activity = Instant::now();
            }
            SessionStatus::Disconnected | SessionStatus::Inactive | SessionStatus::Error => {
                entry.record.disconnected_at = Some(now_ms());
                entry.record.credential = None;
            }
            _ => {}
        }

        if was_active && !next.is_active() {
            self.decrement_active();
        } else if !was_active && next.is_active() {
            self.active_count.fetch_add(1, Ordering::SeqCst);
        }

        self.store.upsert(&entry.record)?;
        debug!("Session {} status {} -> {}", code, from, next);
        Ok(())
    }

    /// Store the credential payload once the provider delivers it
    pub fn set_credential(&self, code: &str, payload: String) -> Result<(), RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(code)
            .ok_or_else(|| RegistryError::SessionNotFound(code.to_string()))?;

        entry.record.credential = Some(payload);
        self.store.upsert(&entry.record)?;
        debug!("Session {} credential stored", code);
        Ok(())
    }

    /// Get a session record: the live copy if present, otherwise the
    /// durable record of a finished session
    pub fn get(&self, code: &str) -> Result<Option<SessionRecord>, RegistryError> {
        if let Some(entry) = self.sessions.get(code) {
            return Ok(Some(entry.record.clone()));
        }
        Ok(self.store.get(code)?)
    }

    /// All of an owner's records, newest-first
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SessionRecord>, RegistryError> {
        let mut records = self.store.list_by_owner(owner_id)?;
        records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
        Ok(records)
    }

    /// Close and remove a live session, persisting `terminal` as its final
    /// status. Idempotent: removing an absent code is a no-op.
    ///
    /// Returns whether a live entry was actually removed.
    pub async fn remove(
        &self,
        code: &str,
        terminal: SessionStatus,
    ) -> Result<bool, RegistryError> {
        let Some((_, mut entry)) = self.sessions.remove(code) else {
            debug!("Remove of absent session {} is a no-op", code);
            return Ok(false);
        };

        if entry.record.is_active() {
            self.decrement_active();
        }
        if let Some(mut handle) = entry.handle.take() {
            handle.terminate().await;
        }

        if !entry.record.status.is_terminal() {
            entry.record.status = entry.record.status.transition(terminal)?;
            entry.record.disconnected_at = Some(now_ms());
            entry.record.credential = None;
            self.store.upsert(&entry.record)?;
        }

        info!("Session {} removed ({})", code, entry.record.status);
        Ok(true)
    }

    /// Drop a freshly-created session as if it never existed: terminate any
    /// handle and delete the durable record. Used when the provider fails to
    /// start, so no partial record is left `pending` forever.
    pub async fn discard(&self, code: &str) -> Result<(), RegistryError> {
        if let Some((_, mut entry)) = self.sessions.remove(code) {
            if entry.record.is_active() {
                self.decrement_active();
            }
            if let Some(mut handle) = entry.handle.take() {
                handle.terminate().await;
            }
        }
        self.store.delete(code)?;
        warn!("Session {} discarded", code);
        Ok(())
    }

    /// Codes and last-activity instants of all live sessions. The cleanup
    /// sweep works from this snapshot rather than holding map guards.
    pub fn activity_snapshot(&self) -> Vec<(String, Instant)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.last_activity))
            .collect()
    }

    /// Number of live entries (handles open or starting)
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a live entry exists for this code
    pub fn contains(&self, code: &str) -> bool {
        self.sessions.contains_key(code)
    }

    /// Count of active sessions - O(1)
    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Count of an owner's active sessions
    pub fn active_count_for_owner(&self, owner_id: &str) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.record.owner_id == owner_id && e.record.is_active())
            .count()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn max_per_owner(&self) -> usize {
        self.max_per_owner
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_sessions: self.len(),
            active_sessions: self.active_count(),
            max_sessions: self.max_sessions,
            max_per_owner: self.max_per_owner,
        }
    }

    fn decrement_active(&self) {
        // fetch_update to avoid underflow on double-decrement bugs
        let _ = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
    }
}
