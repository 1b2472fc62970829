//! Certificate rotation watcher (spec.md §4.10), replacing the source's
//! fire-and-forget `std::async` restart with an explicit, observable state
//! machine (spec.md §9 design notes).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::transport::TlsCredentials;

/// Collaborator subscribing to the IAM cert-changed stream for a configured
/// storage (e.g. "online"); yields the rebuilt credentials on each rotation.
#[async_trait]
pub trait CertChangeStream: Send {
    async fn next_change(&mut self) -> Option<TlsCredentials>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Rotating,
}

pub type RestartHook = Arc<dyn Fn(TlsCredentials) -> BoxFuture<'static, ()> + Send + Sync>;

/// Watches for certificate rotation and drives an explicit
/// Idle -> Rotating -> Idle cycle per change, so tests can observe that a
/// restart happened instead of racing a detached task.
pub struct CertWatcher {
    state_tx: watch::Sender<WatcherState>,
    delay: Duration,
}

impl CertWatcher {
    /// `delay` lets the call that delivered the new certificate return
    /// before the server serving it is torn down (spec §4.10, "≈1s").
    pub fn new(delay: Duration) -> (Self, watch::Receiver<WatcherState>) {
        let (state_tx, state_rx) = watch::channel(WatcherState::Idle);
        (CertWatcher { state_tx, delay }, state_rx)
    }

    pub async fn run(&self, mut stream: impl CertChangeStream, restart: RestartHook) {
        while let Some(new_credentials) = stream.next_change().await {
            let _ = self.state_tx.send(WatcherState::Rotating);
            tokio::time::sleep(self.delay).await;
            restart(new_credentials).await;
            let _ = self.state_tx.send(WatcherState::Idle);
        }
    }
}
