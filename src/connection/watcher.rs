use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ConnectionError, ConnectionManager};
use crate::constants::HEALTH_CHECK_INTERVAL_SECS;

/// Periodically schedules a reconnect for every registered client that is down.
pub struct HealthWatcher {
    manager: Arc<ConnectionManager>,
    interval_tx: watch::Sender<Duration>,
}

impl HealthWatcher {
    pub fn new(manager: Arc<ConnectionManager>, interval: Duration) -> Self {
        let (interval_tx, _) = watch::channel(interval);
        Self {
            manager,
            interval_tx,
        }
    }

    #[allow(dead_code)]
    pub fn with_default_interval(manager: Arc<ConnectionManager>) -> Self {
        Self::new(manager, Duration::from_secs(HEALTH_CHECK_INTERVAL_SECS))
    }

    #[allow(dead_code)]
    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Takes effect immediately, restarting the current wait.
    #[allow(dead_code)]
    pub fn set_interval(&self, interval: Duration) {
        self.interval_tx.send_replace(interval);
    }

    /// One health check pass. Returns how many reconnects were queued.
    pub async fn check_once(&self) -> usize {
        let down = self.manager.disconnected().await;
        let mut queued = 0;
        for id in &down {
            match self.manager.schedule_reconnect(id) {
                Ok(()) => queued += 1,
                Err(ConnectionError::Closed) => break,
                Err(e) => tracing::debug!("Health check: {}", e),
            }
        }
        if queued > 0 {
            tracing::info!("Health check queued {} reconnect(s)", queued);
        }
        queued
    }

    /// Run until the manager shuts down.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop = self.manager.stop_signal();
        let mut interval_rx = self.interval_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        self.check_once().await;
                    }
                    changed = interval_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::debug!("Health check interval now {:?}", *interval_rx.borrow());
                    }
                    _ = stop.changed() => break,
                }
            }
            tracing::debug!("Health watcher stopped");
        })
    }
}
