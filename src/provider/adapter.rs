//! Provider Adapter
//!
//! Translates provider lifecycle signals into registry/store updates and
//! event-bus publishes, one pump task per session. On a non-fatal close the
//! adapter attempts exactly one re-start with the same code and session
//! directory; anything else removes the session.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{ConnectionProvider, ProviderError, ProviderSignal};
use crate::events::{EventBus, SignalPayload};
use crate::session::{ConnectionType, SessionRegistry, SessionStatus};

pub struct ProviderAdapter {
    registry: Arc<SessionRegistry>,
    bus: Arc<EventBus>,
    provider: Arc<dyn ConnectionProvider>,
    /// Root under which each session gets `<root>/<code>`
    session_root: PathBuf,
}

impl ProviderAdapter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<EventBus>,
        provider: Arc<dyn ConnectionProvider>,
        session_root: PathBuf,
    ) -> Self {
        Self {
            registry,
            bus,
            provider,
            session_root,
        }
    }

    /// Start the provider session for a freshly-created code and spawn its
    /// signal pump. On failure the session record is left untouched; the
    /// caller decides whether to discard it.
    pub async fn start(
        self: &Arc<Self>,
        code: &str,
        connection_type: ConnectionType,
    ) -> Result<(), ProviderError> {
        let dir = self.session_root.join(code);
        let session = self.provider.start_session(&dir, connection_type).await?;

        if let Err(e) = self.registry.attach(code, session.handle) {
            // The session vanished (or double-started) while the provider
            // was coming up; nothing to pump
            return Err(ProviderError::StartFailed(e.to_string()));
        }
        if let Err(e) = self.registry.update_status(code, connection_type.waiting_status()) {
            warn!("Session {} started but transition failed: {}", code, e);
        }

        let adapter = Arc::clone(self);
        let code = code.to_string();
        tokio::spawn(async move {
            adapter.pump(code, connection_type, session.signals).await;
        });
        Ok(())
    }

    /// Consume one session's signal channel until the session ends
    async fn pump(
        self: Arc<Self>,
        code: String,
        connection_type: ConnectionType,
        mut signals: mpsc::Receiver<ProviderSignal>,
    ) {
        loop {
            let Some(signal) = signals.recv().await else {
                // Provider dropped the channel without a close signal;
                // treat it as a fatal close
                warn!("Session {} signal channel closed by provider", code);
                self.finish(&code, SessionStatus::Disconnected).await;
                return;
            };

            match signal {
                ProviderSignal::CredentialReady(payload) => {
                    debug!("Session {} credential ready", code);
                    if let Err(e) = self.registry.set_credential(&code, payload.clone()) {
                        warn!("Session {} credential not stored: {}", code, e);
                    }
                    self.bus.publish(&code, SignalPayload::Credential(payload));
                }
                ProviderSignal::Connected(metadata) => {
                    info!(
                        "Session {} linked{}",
                        code,
                        metadata
                            .remote_id
                            .as_deref()
                            .map(|id| format!(" as {}", id))
                            .unwrap_or_default()
                    );
                    if let Err(e) = self.registry.update_status(&code, SessionStatus::Connected) {
                        warn!("Session {} connect transition failed: {}", code, e);
                    }
                    self.bus.publish(&code, SignalPayload::Connected(metadata));
                }
                ProviderSignal::Closed { should_reconnect } => {
                    self.bus
                        .publish(&code, SignalPayload::Closed { should_reconnect });

                    if should_reconnect && self.registry.try_mark_reconnect(&code) {
                        match self.restart(&code, connection_type).await {
                            Ok(new_signals) => {
                                signals = new_signals;
                                continue;
                            }
                            Err(e) => {
                                error!("Session {} re-start failed: {}", code, e);
                                self.finish(&code, SessionStatus::Error).await;
                                return;
                            }
                        }
                    }

                    info!(
                        "Session {} closed (reconnect {})",
                        code,
                        if should_reconnect { "exhausted" } else { "not requested" }
                    );
                    self.finish(&code, SessionStatus::Disconnected).await;
                    return;
                }
            }
        }
    }

    /// The single reconnect attempt: retire the old handle, fall back to
    /// `pending`, and start the provider again with the same code and
    /// session directory
    async fn restart(
        &self,
        code: &str,
        connection_type: ConnectionType,
    ) -> Result<mpsc::Receiver<ProviderSignal>, ProviderError> {
        info!("Session {} attempting single reconnect", code);

        if let Some(mut old) = self.registry.detach_handle(code) {
            old.terminate().await;
        }
        self.registry
            .update_status(code, SessionStatus::Pending)
            .map_err(|e| ProviderError::StartFailed(e.to_string()))?;

        let dir = self.session_root.join(code);
        let session = self.provider.start_session(&dir, connection_type).await?;

        self.registry
            .attach(code, session.handle)
            .map_err(|e| ProviderError::StartFailed(e.to_string()))?;
        self.registry
            .update_status(code, connection_type.waiting_status())
            .map_err(|e| ProviderError::StartFailed(e.to_string()))?;
        Ok(session.signals)
    }

    /// Terminal path shared by every way a pump ends
    async fn finish(&self, code: &str, terminal: SessionStatus) {
        if let Err(e) = self.registry.remove(code, terminal).await {
            warn!("Session {} removal failed: {}", code, e);
        }
        self.bus.purge(code);
    }
}
