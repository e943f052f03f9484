//! Application suspend/resume signals.
//!
//! Mobile hosts pause replication when the app is backgrounded. Other hosts
//! use [`NoopLifecycle`], which never suspends.

use std::sync::Arc;
use tokio::sync::watch;

/// Whether the host application is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Replication may run.
    Active,
    /// Replication must pause.
    Suspended,
}

/// Source of suspend/resume signals.
pub trait LifecycleSource: Send + Sync {
    /// Subscribes to state changes.
    fn subscribe(&self) -> watch::Receiver<AppState>;
}

/// Never suspends.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl LifecycleSource for NoopLifecycle {
    fn subscribe(&self) -> watch::Receiver<AppState> {
        // The sender is dropped at once; subscribers see the channel close.
        watch::channel(AppState::Active).1
    }
}

/// Lifecycle driven by the embedding application.
#[derive(Debug, Clone)]
pub struct ManualLifecycle {
    state: Arc<watch::Sender<AppState>>,
}

impl ManualLifecycle {
    /// Creates an active lifecycle.
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::channel(AppState::Active).0),
        }
    }

    /// Signals that the application went to the background.
    pub fn suspend(&self) {
        self.state.send_replace(AppState::Suspended);
    }

    /// Signals that the application is active again.
    pub fn resume(&self) {
        self.state.send_replace(AppState::Active);
    }

    /// Returns the current state.
    pub fn state(&self) -> AppState {
        *self.state.borrow()
    }
}

impl Default for ManualLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleSource for ManualLifecycle {
    fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_lifecycle_notifies() {
        let lifecycle = ManualLifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert_eq!(*rx.borrow(), AppState::Active);

        lifecycle.suspend();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), AppState::Suspended);
        assert_eq!(lifecycle.state(), AppState::Suspended);

        lifecycle.resume();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), AppState::Active);
    }

    #[tokio::test]
    async fn noop_lifecycle_closes() {
        let mut rx = NoopLifecycle.subscribe();
        assert_eq!(*rx.borrow(), AppState::Active);
        assert!(rx.changed().await.is_err());
    }
}
