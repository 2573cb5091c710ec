//! Subbot Manager Facade
//!
//! The inbound command surface over the whole subsystem: create a session,
//! list an owner's sessions, delete with ownership check, and the bounded
//! waits for credential delivery and link confirmation. Constructed once at
//! process start and passed by reference to whatever consumes it.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::events::{await_signal, await_signal_cancellable, EventBus, SignalKind, SignalPayload, WaitError};
use crate::memory::MemoryProbe;
use crate::provider::{ConnectionProvider, ProviderAdapter};
use crate::session::{
    AdmissionController, CleanupHandle, CleanupScheduler, ConnectionType, RegistryStats,
    SessionRecord, SessionRegistry, SessionStatus,
};
use crate::store::SessionStore;

/// Reply to a successful create
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSession {
    pub code: String,
    pub connection_type: ConnectionType,
}

pub struct SubbotManager {
    config: ManagerConfig,
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
    adapter: Arc<ProviderAdapter>,
    admission: AdmissionController,
    cleanup_scheduler: Arc<CleanupScheduler>,
    cleanup: parking_lot::Mutex<Option<CleanupHandle>>,
}

impl SubbotManager {
    pub fn new(
        config: ManagerConfig,
        provider: Arc<dyn ConnectionProvider>,
        store: Arc<dyn SessionStore>,
        memory: Arc<dyn MemoryProbe>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&store),
            config.max_sessions,
            config.max_per_owner,
        ));
        let bus = Arc::new(EventBus::new());
        let adapter = Arc::new(ProviderAdapter::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            provider,
            config.session_dir.clone(),
        ));
        let admission = AdmissionController::new(
            Arc::clone(&registry),
            Arc::clone(&memory),
            config.clone(),
        );
        let cleanup_scheduler = Arc::new(CleanupScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            memory,
            config.clone(),
        ));

        Arc::new(Self {
            config,
            registry,
            bus,
            adapter,
            admission,
            cleanup_scheduler,
            cleanup: parking_lot::Mutex::new(None),
        })
    }

    /// Start the background cleanup loop. Idempotent.
    pub fn start(&self) {
        let mut guard = self.cleanup.lock();
        if guard.is_none() {
            *guard = Some(Arc::clone(&self.cleanup_scheduler).spawn());
            info!(
                "Subbot manager started (capacity {}, per-owner {})",
                self.config.max_sessions, self.config.max_per_owner
            );
        }
    }

    /// Create a session for `owner_id` and start its provider session.
    ///
    /// Admission is checked up front; the registry re-validates capacity
    /// under its create lock. If the provider fails to start, the fresh
    /// record is discarded so nothing is left `pending` forever.
    pub async fn create(
        &self,
        owner_id: &str,
        connection_type: ConnectionType,
    ) -> Result<CreatedSession, ManagerError> {
        self.admission.check(owner_id)?;
        let code = self.registry.create(owner_id, connection_type)?;

        if let Err(e) = self.adapter.start(&code, connection_type).await {
            warn!("Provider start failed for session {}: {}", code, e);
            if let Err(discard_err) = self.registry.discard(&code).await {
                warn!("Discard after failed start also failed: {}", discard_err);
            }
            return Err(e.into());
        }

        Ok(CreatedSession {
            code,
            connection_type,
        })
    }

    /// All of an owner's sessions, newest-first
    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<SessionRecord>, ManagerError> {
        Ok(self.registry.list_by_owner(owner_id)?)
    }

    /// One session record, live or historical
    pub fn get(&self, code: &str) -> Result<Option<SessionRecord>, ManagerError> {
        Ok(self.registry.get(code)?)
    }

    /// Close and remove a session. Only its owner may delete it; an owner
    /// mismatch is an authorization error, distinct from not-found.
    pub async fn delete(&self, code: &str, requesting_owner: &str) -> Result<(), ManagerError> {
        let record = self
            .registry
            .get(code)?
            .ok_or_else(|| ManagerError::NotFound(code.to_string()))?;
        if record.owner_id != requesting_owner {
            return Err(ManagerError::Unauthorized(code.to_string()));
        }

        self.registry.remove(code, SessionStatus::Disconnected).await?;
        self.bus.purge(code);
        info!("Session {} deleted by owner {}", code, requesting_owner);
        Ok(())
    }

    /// Wait for the session's scan or pairing payload.
    ///
    /// If the credential already arrived it is returned immediately;
    /// otherwise this suspends (only the calling task) until the provider
    /// delivers it or the window elapses. Defaults to the per-type window
    /// from config when `timeout` is `None`.
    pub async fn await_credential(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ManagerError> {
        self.wait_credential(code, timeout, None).await
    }

    /// Cancellable variant of [`Self::await_credential`] for callers whose
    /// own request may be aborted mid-wait
    pub async fn await_credential_cancellable(
        &self,
        code: &str,
        timeout: Option<Duration>,
        cancel: oneshot::Receiver<()>,
    ) -> Result<String, ManagerError> {
        self.wait_credential(code, timeout, Some(cancel)).await
    }

    async fn wait_credential(
        &self,
        code: &str,
        timeout: Option<Duration>,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<String, ManagerError> {
        let record = self
            .registry
            .get(code)?
            .ok_or_else(|| ManagerError::NotFound(code.to_string()))?;
        if let Some(credential) = record.credential {
            return Ok(credential);
        }

        let timeout =
            timeout.unwrap_or_else(|| self.config.credential_timeout(record.connection_type));
        let outcome = match cancel {
            Some(cancel) => {
                await_signal_cancellable(&self.bus, code, SignalKind::Credential, timeout, cancel)
                    .await
            }
            None => await_signal(&self.bus, code, SignalKind::Credential, timeout).await,
        };

        match outcome {
            Ok(SignalPayload::Credential(payload)) => Ok(payload),
            Ok(_) => Err(WaitError::SessionClosed {
                code: code.to_string(),
                kind: SignalKind::Credential,
            }
            .into()),
            Err(e @ WaitError::Timeout { .. }) => {
                // The credential may have been stored between the record
                // check and the subscription; the stored copy wins over a
                // raced-out publish
                if let Some(credential) =
                    self.registry.get(code)?.and_then(|r| r.credential)
                {
                    return Ok(credential);
                }
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for a session to finish linking. Same bounded-wait shape as
    /// credential delivery; used to forward a confirmation once the link
    /// completes.
    pub async fn await_connected(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<(), ManagerError> {
        let record = self
            .registry
            .get(code)?
            .ok_or_else(|| ManagerError::NotFound(code.to_string()))?;
        if record.status == SessionStatus::Connected {
            return Ok(());
        }

        match await_signal(&self.bus, code, SignalKind::Connected, timeout).await {
            Ok(_) => Ok(()),
            Err(e @ WaitError::Timeout { .. }) => {
                // The link may have completed between the status check and
                // the subscription; the adapter writes the registry before
                // publishing, so the registry copy wins over a raced-out
                // publish
                match self.registry.get(code)? {
                    Some(record) if record.status == SessionStatus::Connected => Ok(()),
                    _ => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record inbound traffic on a session
    pub fn touch(&self, code: &str) -> Result<(), ManagerError> {
        Ok(self.registry.touch(code)?)
    }

    /// Force one cleanup sweep outside the interval
    pub async fn sweep_now(&self) -> crate::session::SweepSummary {
        self.cleanup_scheduler.sweep_once().await
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Drain: stop the cleanup loop and close every live session
    pub async fn shutdown(&self) {
        info!("Subbot manager draining, stats {}", self.registry.stats());
        let handle = self.cleanup.lock().take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }

        for (code, _) in self.registry.activity_snapshot() {
            if let Err(e) = self.registry.remove(&code, SessionStatus::Disconnected).await {
                warn!("Shutdown removal of session {} failed: {}", code, e);
            }
            self.bus.purge(&code);
        }
        info!("Subbot manager drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::StaticMemoryProbe;
    use crate::provider::{mock::MockProvider, ProviderSignal};
    use crate::session::ConnectionMetadata;
    use crate::store::MemorySessionStore;

    struct Fixture {
        manager: Arc<SubbotManager>,
        provider: Arc<MockProvider>,
        memory: Arc<StaticMemoryProbe>,
    }

    fn fixture(config: ManagerConfig) -> Fixture {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("subbot_manager=debug")
            .with_test_writer()
            .try_init();

        let provider = Arc::new(MockProvider::new());
        let memory = Arc::new(StaticMemoryProbe::new(0));
        let manager = SubbotManager::new(
            config,
            Arc::clone(&provider) as Arc<dyn ConnectionProvider>,
            MemorySessionStore::shared(),
            Arc::clone(&memory) as Arc<dyn MemoryProbe>,
        );
        Fixture {
            manager,
            provider,
            memory,
        }
    }

    #[tokio::test]
    async fn test_create_then_credential_then_connected() {
        let f = fixture(ManagerConfig::default());
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();
        let code = created.code.clone();

        // Provider delivers the scan payload shortly after creation
        let provider = Arc::clone(&f.provider);
        let publish_code = code.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            provider
                .signal(
                    &publish_code,
                    ProviderSignal::CredentialReady("QR-DATA-1".into()),
                )
                .await;
        });

        let payload = f
            .manager
            .await_credential(&code, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(payload, "QR-DATA-1");

        f.provider
            .signal(
                &code,
                ProviderSignal::Connected(ConnectionMetadata::default()),
            )
            .await;
        f.manager
            .await_connected(&code, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            f.manager.get(&code).unwrap().unwrap().status,
            SessionStatus::Connected
        );
    }

    #[tokio::test]
    async fn test_credential_already_available() {
        let f = fixture(ManagerConfig::default());
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();

        f.provider
            .signal(
                &created.code,
                ProviderSignal::CredentialReady("QR-EARLY".into()),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The publish already happened; the stored payload is returned
        let payload = f
            .manager
            .await_credential(&created.code, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(payload, "QR-EARLY");
    }

    #[tokio::test]
    async fn test_credential_timeout_is_distinct() {
        let f = fixture(ManagerConfig::default());
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();

        let result = f
            .manager
            .await_credential(&created.code, Some(Duration::from_millis(20)))
            .await;
        let err = result.unwrap_err();
        assert!(err.is_timeout());
        // No residual subscription after the timeout
        assert_eq!(
            f.manager.bus().subscriber_count(&created.code, SignalKind::Credential),
            0
        );
    }

    #[tokio::test]
    async fn test_await_connected_survives_missed_publish() {
        let f = fixture(ManagerConfig::default());
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();
        let code = created.code.clone();

        // Flip the status without a matching publish, as a connect landing
        // between the status check and the subscription would
        let registry = Arc::clone(f.manager.registry());
        let flip_code = code.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry
                .update_status(&flip_code, SessionStatus::Connected)
                .unwrap();
        });

        f.manager
            .await_connected(&code, Duration::from_millis(100))
            .await
            .unwrap();
        // A session that never connects still times out
        let other = f.manager.create("u2", ConnectionType::Scan).await.unwrap();
        let result = f
            .manager
            .await_connected(&other.code, Duration::from_millis(20))
            .await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_per_owner_capacity_two_of_three() {
        let f = fixture(ManagerConfig {
            max_per_owner: 2,
            ..Default::default()
        });

        assert!(f.manager.create("u1", ConnectionType::Scan).await.is_ok());
        assert!(f.manager.create("u1", ConnectionType::Scan).await.is_ok());
        let third = f.manager.create("u1", ConnectionType::Scan).await;
        match third {
            Err(ManagerError::Admission(crate::session::AdmissionError::OwnerCapacity {
                current,
                max,
            })) => {
                assert_eq!((current, max), (2, 2));
            }
            other => panic!("expected owner-capacity refusal, got {:?}", other.map(|c| c.code)),
        }
    }

    #[tokio::test]
    async fn test_memory_pressure_blocks_admission() {
        let f = fixture(ManagerConfig::default());
        f.memory
            .set(f.manager.config.memory_soft_limit_bytes() + 1);
        let result = f.manager.create("u1", ConnectionType::Scan).await;
        assert!(matches!(
            result,
            Err(ManagerError::Admission(
                crate::session::AdmissionError::MemoryPressure { .. }
            ))
        ));
    }

    #[tokio::test]
    async fn test_provider_start_failure_leaves_no_record() {
        let f = fixture(ManagerConfig::default());
        f.provider.fail_next_start();

        let result = f.manager.create("u1", ConnectionType::Scan).await;
        assert!(matches!(result, Err(ManagerError::Provider(_))));
        assert!(f.manager.list_by_owner("u1").unwrap().is_empty());
        assert_eq!(f.manager.stats().active_sessions, 0);

        // The slot is free again
        assert!(f.manager.create("u1", ConnectionType::Scan).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_authorization() {
        let f = fixture(ManagerConfig::default());
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();

        let denied = f.manager.delete(&created.code, "u2").await;
        assert!(matches!(denied, Err(ManagerError::Unauthorized(_))));

        let missing = f.manager.delete("no-such-code", "u1").await;
        assert!(matches!(missing, Err(ManagerError::NotFound(_))));

        f.manager.delete(&created.code, "u1").await.unwrap();
        assert_eq!(
            f.manager.get(&created.code).unwrap().unwrap().status,
            SessionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_sweep() {
        let f = fixture(ManagerConfig {
            idle_timeout_secs: 0,
            ..Default::default()
        });
        let created = f.manager.create("u1", ConnectionType::Scan).await.unwrap();

        let summary = f.manager.sweep_now().await;
        assert_eq!(summary.idle_reclaimed, 1);
        assert!(!f.manager.registry().contains(&created.code));
        assert_eq!(
            f.manager.get(&created.code).unwrap().unwrap().status,
            SessionStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_concurrent_creates_never_exceed_caps() {
        let f = fixture(ManagerConfig {
            max_sessions: 4,
            max_per_owner: 4,
            ..Default::default()
        });

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = Arc::clone(&f.manager);
            let owner = format!("u{}", i % 4);
            tasks.push(tokio::spawn(async move {
                manager.create(&owner, ConnectionType::Scan).await.is_ok()
            }));
        }
        let created: usize = {
            let mut ok = 0;
            for task in tasks {
                if task.await.unwrap() {
                    ok += 1;
                }
            }
            ok
        };

        assert_eq!(created, 4);
        assert_eq!(f.manager.stats().active_sessions, 4);
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let f = fixture(ManagerConfig::default());
        f.manager.start();
        let a = f.manager.create("u1", ConnectionType::Scan).await.unwrap();
        let b = f.manager.create("u2", ConnectionType::Pairing).await.unwrap();

        f.manager.shutdown().await;
        assert_eq!(f.manager.stats().live_sessions, 0);
        for code in [a.code, b.code] {
            assert_eq!(
                f.manager.get(&code).unwrap().unwrap().status,
                SessionStatus::Disconnected
            );
            assert!(f.provider.terminated(&code));
        }
    }
}
