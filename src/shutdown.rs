//! Shutdown Coordinator: turns SIGINT/SIGTERM into a cooperative stop flag.
//!
//! Workers never block on the signal itself — they poll [`ShutdownCoordinator::should_stop`]
//! at suspension points (semaphore acquire, subprocess wait, log read) at least once a second,
//! per the cancellation model.

use crate::phase::PipelineState;
use crate::state::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use tracing::{error, warn};

#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    stop_requested: AtomicBool,
    saving: AtomicBool,
    install_once: Once,
    current_state: Mutex<Option<PipelineState>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                stop_requested: AtomicBool::new(false),
                saving: AtomicBool::new(false),
                install_once: Once::new(),
                current_state: Mutex::new(None),
            }),
        }
    }

    /// Registers SIGINT/SIGTERM handlers. Idempotent: a second call is a
    /// no-op, so callers never end up with duplicate handler tasks.
    pub fn install(&self) {
        self.inner.install_once.call_once(|| {
            let coordinator = self.clone();
            tokio::spawn(async move {
                coordinator.wait_for_signal().await;
            });
        });
    }

    #[cfg(unix)]
    async fn wait_for_signal(&self) {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => warn!("received SIGINT, requesting shutdown"),
            _ = sigterm.recv() => warn!("received SIGTERM, requesting shutdown"),
        }
        self.request_stop();
    }

    #[cfg(not(unix))]
    async fn wait_for_signal(&self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received CTRL_BREAK, requesting shutdown");
            self.request_stop();
        }
    }

    fn request_stop(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Thread-safe; cheap enough to poll on every loop iteration.
    pub fn should_stop(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    /// Registers the live state reference so [`emergency_save`] has
    /// something to persist if a signal arrives mid-phase.
    pub fn set_state(&self, state: PipelineState) {
        *self.inner.current_state.lock().unwrap() = Some(state);
    }

    /// Best-effort save of the last registered state. Swallows every error
    /// — a failure here must never mask the original signal that triggered
    /// the shutdown.
    pub fn emergency_save(&self, store: &StateStore) {
        if self.inner.saving.swap(true, Ordering::SeqCst) {
            // A second signal arrived while a save is already in flight.
            return;
        }
        let guard = self.inner.current_state.lock().unwrap();
        if let Some(state) = guard.as_ref() {
            if let Err(e) = store.save(state) {
                error!("emergency save failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn should_stop_is_false_before_any_signal() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.should_stop());
    }

    #[test]
    fn request_stop_is_observed_by_should_stop() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_stop();
        assert!(coordinator.should_stop());
    }

    #[test]
    fn emergency_save_with_no_state_does_not_panic() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let coordinator = ShutdownCoordinator::new();
        coordinator.emergency_save(&store);
    }

    #[test]
    fn emergency_save_persists_registered_state() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let coordinator = ShutdownCoordinator::new();
        let state = PipelineState::init("run-1", PathBuf::from("prd.md"));
        coordinator.set_state(state.clone());
        coordinator.emergency_save(&store);
        let loaded = store.load().unwrap();
        assert_eq!(loaded.run_id, state.run_id);
    }

    #[test]
    fn reentrant_emergency_save_does_not_panic() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let coordinator = ShutdownCoordinator::new();
        coordinator.set_state(PipelineState::init("run-1", PathBuf::from("prd.md")));
        coordinator.emergency_save(&store);
        coordinator.emergency_save(&store);
    }
}
