//! Connection lifecycle: registry of live clients and backed-off reconnection.
//!
//! - `mod.rs` - `ManagedConnection` contract and `ConnectionManager`
//! - `watcher.rs` - periodic health check feeding the manager

mod watcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::constants::{
    BACKOFF_BASE_SECS, IMAP_CLIENT_PREFIX, MAX_RETRY_DELAY_SECS, RECONNECT_QUEUE_CAPACITY,
};
use crate::retry::delay_for_attempt;

pub use watcher::HealthWatcher;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("reconnect queue full, dropped request for '{0}'")]
    QueueFull(String),
    #[error("no client registered as '{0}'")]
    UnknownClient(String),
    #[error("connection manager is shut down")]
    Closed,
}

/// Anything the manager can supervise.
#[async_trait]
pub trait ManagedConnection: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn reconnect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Invoked with the account id after an IMAP client reconnects.
pub type ReconnectHook = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct BackoffState {
    attempts: u32,
    next_attempt: Instant,
    /// A delayed retry for this id is already queued
    retry_pending: bool,
}

pub struct ConnectionManager {
    clients: RwLock<HashMap<String, Arc<dyn ManagedConnection>>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    on_reconnect: RwLock<Option<ReconnectHook>>,
    stop_tx: watch::Sender<bool>,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(BACKOFF_BASE_SECS),
            Duration::from_secs(MAX_RETRY_DELAY_SECS),
        )
    }
}

impl ConnectionManager {
    pub fn new(backoff_base: Duration, backoff_max: Duration) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(RECONNECT_QUEUE_CAPACITY);
        let (stop_tx, _) = watch::channel(false);
        Self {
            clients: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            on_reconnect: RwLock::new(None),
            stop_tx,
            backoff_base,
            backoff_max,
        }
    }

    //
    // Registry
    //

    pub async fn register(&self, id: &str, client: Arc<dyn ManagedConnection>) {
        self.clients.write().await.insert(id.to_string(), client);
        tracing::debug!("Registered connection '{}'", id);
    }

    #[allow(dead_code)]
    pub async fn unregister(&self, id: &str) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ManagedConnection>> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of registered clients that report no live connection.
    pub async fn disconnected(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(_, client)| !client.is_connected())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self.on_reconnect.write().await = Some(hook);
    }

    /// Stop signal shared with the worker and watchers.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    //
    // Reconnection
    //

    /// Queue a reconnect without waiting. A full queue drops the request.
    pub fn schedule_reconnect(&self, id: &str) -> Result<(), ConnectionError> {
        match self.queue_tx.try_send(id.to_string()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Reconnect queue full, dropping request for '{}'", id);
                Err(ConnectionError::QueueFull(id.to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(ConnectionError::Closed),
        }
    }

    /// Reconnect one client immediately, bypassing the queue.
    #[allow(dead_code)]
    pub async fn reconnect_now(&self, id: &str) -> Result<()> {
        let client = self
            .get(id)
            .await
            .ok_or_else(|| ConnectionError::UnknownClient(id.to_string()))?;
        client.reconnect().await
    }

    /// Spawn the single reconnect worker. Only the first call starts one.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let rx = self.queue_rx.lock().await.take()?;
        let manager = self.clone();
        Some(tokio::spawn(async move { manager.worker(rx).await }))
    }

    async fn worker(self: Arc<Self>, mut rx: mpsc::Receiver<String>) {
        let mut stop = self.stop_signal();
        let mut states: HashMap<String, BackoffState> = HashMap::new();
        tracing::debug!("Reconnect worker started");

        loop {
            let id = tokio::select! {
                id = rx.recv() => match id {
                    Some(id) => id,
                    None => break,
                },
                _ = stop.changed() => break,
            };
            if *stop.borrow() {
                break;
            }

            let Some(client) = self.get(&id).await else {
                states.remove(&id);
                continue;
            };
            if client.is_connected() {
                states.remove(&id);
                continue;
            }

            let now = Instant::now();
            if let Some(state) = states.get_mut(&id)
                && now < state.next_attempt
            {
                // Too early: make sure exactly one retry is waiting for this id
                if !state.retry_pending {
                    state.retry_pending = true;
                    self.requeue_after(id, state.next_attempt - now);
                }
                continue;
            }

            match client.reconnect().await {
                Ok(()) => {
                    if let Some(state) = states.remove(&id) {
                        tracing::info!(
                            "Reconnected '{}' after {} failed attempt(s)",
                            id,
                            state.attempts
                        );
                    } else {
                        tracing::info!("Reconnected '{}'", id);
                    }
                    self.after_reconnect(&id).await;
                }
                Err(e) => {
                    let state = states.entry(id.clone()).or_insert(BackoffState {
                        attempts: 0,
                        next_attempt: now,
                        retry_pending: false,
                    });
                    state.attempts += 1;
                    let delay = delay_for_attempt(self.backoff_base, self.backoff_max, state.attempts);
                    state.next_attempt = Instant::now() + delay;
                    state.retry_pending = true;
                    tracing::warn!(
                        "Reconnect of '{}' failed (attempt {}), next try in {:?}: {:#}",
                        id,
                        state.attempts,
                        delay,
                        e
                    );
                    self.requeue_after(id, delay);
                }
            }
        }

        tracing::debug!("Reconnect worker stopped");
    }

    fn requeue_after(&self, id: String, delay: Duration) {
        let tx = self.queue_tx.clone();
        let mut stop = self.stop_signal();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(TrySendError::Full(id)) = tx.try_send(id) {
                        tracing::warn!("Reconnect queue full, dropping retry for '{}'", id);
                    }
                }
                _ = stop.changed() => {}
            }
        });
    }

    async fn after_reconnect(&self, id: &str) {
        let Some(account_id) = id.strip_prefix(IMAP_CLIENT_PREFIX) else {
            return;
        };
        let hook = self.on_reconnect.read().await.clone();
        if let Some(hook) = hook {
            tokio::spawn(hook(account_id.to_string()));
        }
    }

    /// Stop the worker and watchers and disconnect every client.
    pub async fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        let clients: Vec<(String, Arc<dyn ManagedConnection>)> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(id, c)| (id.clone(), c.clone()))
            .collect();
        for (id, client) in clients {
            if let Err(e) = client.disconnect().await {
                tracing::warn!("Failed to disconnect '{}': {:#}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Fails the first `failures` reconnects, recording when each attempt happened.
    struct FlakyConnection {
        connected: AtomicBool,
        failures: AtomicU32,
        attempts: StdMutex<Vec<Instant>>,
    }

    impl FlakyConnection {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                connected: AtomicBool::new(false),
                failures: AtomicU32::new(failures),
                attempts: StdMutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ManagedConnection for FlakyConnection {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn reconnect(&self) -> Result<()> {
            self.attempts.lock().unwrap().push(Instant::now());
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("connection refused");
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_reconnect_with_backoff_then_hook() {
        let manager = Arc::new(ConnectionManager::new(
            Duration::from_millis(20),
            Duration::from_millis(200),
        ));
        let conn = FlakyConnection::new(3);
        manager.register("imap-acct", conn.clone()).await;

        let (hook_tx, mut hook_rx) = mpsc::unbounded_channel();
        manager
            .set_reconnect_hook(Arc::new(move |account| {
                let hook_tx = hook_tx.clone();
                Box::pin(async move {
                    hook_tx.send(account).ok();
                })
            }))
            .await;

        manager.start().await.unwrap();
        manager.schedule_reconnect("imap-acct").unwrap();

        wait_until(|| conn.is_connected()).await;
        let attempts = conn.attempts();
        assert_eq!(attempts.len(), 4);

        // 20ms, 40ms, 80ms between attempts, never shrinking
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(20));
        assert!(gaps[1] >= Duration::from_millis(40));
        assert!(gaps[2] >= Duration::from_millis(80));

        let account = tokio::time::timeout(Duration::from_secs(1), hook_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account, "acct");

        manager.shutdown().await;
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_backoff_resets_after_success() {
        let manager = Arc::new(ConnectionManager::new(
            Duration::from_millis(20),
            Duration::from_millis(1000),
        ));
        let conn = FlakyConnection::new(3);
        manager.register("imap-acct", conn.clone()).await;
        manager.start().await.unwrap();

        // 20ms, 40ms, 80ms, then connected
        manager.schedule_reconnect("imap-acct").unwrap();
        wait_until(|| conn.is_connected()).await;
        assert_eq!(conn.attempts().len(), 4);

        // Drop again with two more failures ahead
        conn.failures.store(2, Ordering::SeqCst);
        conn.connected.store(false, Ordering::SeqCst);
        manager.schedule_reconnect("imap-acct").unwrap();
        wait_until(|| conn.is_connected()).await;

        let attempts = conn.attempts();
        assert_eq!(attempts.len(), 7);
        // Back at the base delay instead of continuing from 160ms
        let gap = attempts[5] - attempts[4];
        assert!(gap >= Duration::from_millis(20));
        assert!(gap < Duration::from_millis(160), "gap {:?}", gap);
        assert!(attempts[6] - attempts[5] >= Duration::from_millis(40));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_requests_do_not_speed_up_backoff() {
        let manager = Arc::new(ConnectionManager::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
        ));
        let conn = FlakyConnection::new(1);
        manager.register("smtp-acct", conn.clone()).await;
        manager.start().await.unwrap();

        manager.schedule_reconnect("smtp-acct").unwrap();
        wait_until(|| conn.attempts().len() == 1).await;
        for _ in 0..5 {
            manager.schedule_reconnect("smtp-acct").unwrap();
        }

        wait_until(|| conn.is_connected()).await;
        let attempts = conn.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] - attempts[0] >= Duration::from_millis(100));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_requests() {
        // No worker: nothing drains the queue
        let manager = ConnectionManager::default();
        for _ in 0..RECONNECT_QUEUE_CAPACITY {
            manager.schedule_reconnect("imap-acct").unwrap();
        }
        assert!(matches!(
            manager.schedule_reconnect("imap-acct"),
            Err(ConnectionError::QueueFull(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_and_unknown_client() {
        let manager = ConnectionManager::default();
        let conn = FlakyConnection::new(0);
        manager.register("imap-a", conn.clone()).await;
        manager.register("smtp-a", FlakyConnection::new(0)).await;

        assert_eq!(manager.ids().await, vec!["imap-a", "smtp-a"]);
        assert_eq!(manager.disconnected().await.len(), 2);

        manager.reconnect_now("imap-a").await.unwrap();
        assert_eq!(manager.disconnected().await, vec!["smtp-a"]);

        let err = manager.reconnect_now("imap-b").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConnectionError>(),
            Some(ConnectionError::UnknownClient(_))
        ));
        assert!(manager.unregister("smtp-a").await);
        assert!(!manager.unregister("smtp-a").await);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let manager = Arc::new(ConnectionManager::default());
        assert!(manager.start().await.is_some());
        assert!(manager.start().await.is_none());
        manager.shutdown().await;
    }
}
