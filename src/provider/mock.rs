//! Scriptable provider for lifecycle tests: signals are injected by the
//! test, handles record termination.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{
    ConnectionProvider, ProviderError, ProviderHandle, ProviderSession, ProviderSignal,
};
use crate::session::ConnectionType;

pub struct MockProvider {
    /// Signal injectors per code, keyed by the session directory name
    senders: DashMap<String, mpsc::Sender<ProviderSignal>>,
    /// Termination flags per code
    terminated: DashMap<String, Arc<AtomicBool>>,
    start_count: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            senders: DashMap::new(),
            terminated: DashMap::new(),
            start_count: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    /// Make the next start_session call fail
    pub fn fail_next_start(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    /// Inject a lifecycle signal for a started session
    pub async fn signal(&self, code: &str, signal: ProviderSignal) {
        let tx = self
            .senders
            .get(code)
            .map(|s| s.clone())
            .unwrap_or_else(|| panic!("no started session for code {code}"));
        tx.send(signal).await.expect("signal channel closed");
    }

    /// Whether the handle most recently issued for `code` was terminated
    pub fn terminated(&self, code: &str) -> bool {
        self.terminated
            .get(code)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

struct MockHandle {
    flag: Arc<AtomicBool>,
}

#[async_trait]
impl ProviderHandle for MockHandle {
    async fn terminate(&mut self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionProvider for MockProvider {
    async fn start_session(
        &self,
        dir: &Path,
        _connection_type: ConnectionType,
    ) -> Result<ProviderSession, ProviderError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProviderError::StartFailed("scripted failure".into()));
        }
        self.start_count.fetch_add(1, Ordering::SeqCst);

        let code = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(16);
        self.senders.insert(code.clone(), tx);

        let flag = Arc::new(AtomicBool::new(false));
        self.terminated.insert(code, Arc::clone(&flag));

        Ok(ProviderSession {
            handle: Box::new(MockHandle { flag }),
            signals: rx,
        })
    }
}
