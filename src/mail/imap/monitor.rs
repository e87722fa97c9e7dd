//! New mail monitor: one loop per client that watches a folder via IDLE or polling.
//!
//! Each cycle reselects the folder, searches above the last seen UID,
//! delivers new messages to the callback and then waits for the server.
//! The first cycle only records the baseline so existing mail is not
//! reported as new.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

use super::{IdleOutcome, ImapClient, ImapError};
use crate::constants::{
    BACKOFF_BASE_SECS, IDLE_TIMEOUT_SECS, MAX_RETRIES, MAX_RETRY_DELAY_SECS, POLL_INTERVAL_SECS,
};
use crate::mail::types::{Message, SearchCriteria};
use crate::retry::{Backoff, RetryConfig, with_retry};

/// Receives each newly observed message, one at a time.
pub type NewMessageCallback = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Scanning (`watching: false`) or parked in IDLE (`watching: true`)
    Idle { watching: bool },
    /// Sleeping between scans because the server lacks IDLE
    Polling,
    /// Terminal until the monitor is started again
    Stopped,
}

/// Timing knobs, shortened in tests.
#[derive(Debug, Clone)]
pub struct MonitorTiming {
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_retries: u32,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            backoff_base: Duration::from_secs(BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(MAX_RETRY_DELAY_SECS),
            max_retries: MAX_RETRIES,
        }
    }
}

pub struct MailboxMonitor {
    client: Arc<ImapClient>,
    folder: String,
    callback: NewMessageCallback,
    timing: MonitorTiming,
    state_tx: watch::Sender<MonitorState>,
    stop_tx: watch::Sender<bool>,
}

impl MailboxMonitor {
    pub fn new(
        client: Arc<ImapClient>,
        folder: &str,
        callback: NewMessageCallback,
        timing: MonitorTiming,
    ) -> Self {
        let (state_tx, _) = watch::channel(MonitorState::Idle { watching: false });
        let (stop_tx, _) = watch::channel(false);
        Self {
            client,
            folder: folder.to_string(),
            callback,
            timing,
            state_tx,
            stop_tx,
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    #[allow(dead_code)]
    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    /// Ask the loop to exit at its next boundary; also interrupts IDLE and polling sleeps.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    fn set_state(&self, state: MonitorState) {
        self.state_tx.send_replace(state);
    }

    /// Run until stopped or until the retry budget is exhausted.
    pub async fn run(&self) -> Result<()> {
        let account = self.client.account_id().to_string();
        let mut stop = self.stop_tx.subscribe();
        let mut last_uid: Option<u32> = None;
        let mut backoff = Backoff::new(self.timing.backoff_base, self.timing.backoff_max);

        tracing::info!("Monitor for '{}' watching '{}'", account, self.folder);

        loop {
            if *stop.borrow() {
                break;
            }

            match self.cycle(&mut last_uid, &mut stop).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    if backoff.attempts() >= self.timing.max_retries {
                        tracing::error!(
                            "Monitor for '{}' on '{}' giving up after {} retries: {:#}",
                            account,
                            self.folder,
                            backoff.attempts(),
                            e
                        );
                        self.set_state(MonitorState::Stopped);
                        return Err(ImapError::MaxRetriesExceeded.into());
                    }

                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Monitor for '{}' on '{}' failed (attempt {}/{}), retrying in {:?}: {:#}",
                        account,
                        self.folder,
                        backoff.attempts(),
                        self.timing.max_retries,
                        delay,
                        e
                    );
                    self.set_state(MonitorState::Idle { watching: false });
                    if sleep_or_stop(delay, &mut stop).await {
                        break;
                    }
                    if let Err(e) = self.client.reconnect().await {
                        tracing::warn!("Monitor reconnect for '{}' failed: {:#}", account, e);
                    }
                }
            }
        }

        tracing::info!("Monitor for '{}' on '{}' stopped", account, self.folder);
        self.set_state(MonitorState::Stopped);
        self.client.disconnect().await.ok();
        Ok(())
    }

    /// One scan followed by one wait.
    async fn cycle(&self, last_uid: &mut Option<u32>, stop: &mut watch::Receiver<bool>) -> Result<()> {
        self.set_state(MonitorState::Idle { watching: false });
        self.client.poll(&self.folder).await?;

        match *last_uid {
            None => {
                let baseline = self.client.highest_uid(&self.folder).await?.unwrap_or(0);
                tracing::debug!(
                    "Monitor baseline for '{}' in '{}' is UID {}",
                    self.client.account_id(),
                    self.folder,
                    baseline
                );
                *last_uid = Some(baseline);
            }
            Some(last) => {
                let messages = self
                    .client
                    .search_and_fetch(&self.folder, &SearchCriteria::uids_from(last.saturating_add(1)))
                    .await?;
                if let Some(max) = messages.iter().map(|m| m.uid).max() {
                    *last_uid = Some(last.max(max));
                    tracing::info!(
                        "{} new message(s) for '{}' in '{}'",
                        messages.len(),
                        self.client.account_id(),
                        self.folder
                    );
                    // Client lock is released here; the callback may use the client
                    for message in messages {
                        (self.callback)(message).await;
                    }
                }
            }
        }

        if *stop.borrow() {
            return Ok(());
        }

        if self.client.supports_idle() {
            self.set_state(MonitorState::Idle { watching: true });
            let outcome = self
                .client
                .idle(&self.folder, self.timing.idle_timeout, stop)
                .await?;
            if outcome == IdleOutcome::Timeout {
                tracing::debug!("IDLE timeout on '{}', refreshing", self.folder);
            }
        } else {
            self.set_state(MonitorState::Polling);
            sleep_or_stop(self.timing.poll_interval, stop).await;
        }
        Ok(())
    }
}

/// Sleep for `delay`; returns true if the stop signal fired first.
async fn sleep_or_stop(delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

struct MonitorEntry {
    monitor: Arc<MailboxMonitor>,
    task: JoinHandle<()>,
}

/// One monitor per client id.
pub struct MonitorRegistry {
    monitors: RwLock<HashMap<String, MonitorEntry>>,
    connect_retry: RetryConfig,
    timing: MonitorTiming,
}

impl Default for MonitorRegistry {
    fn default() -> Self {
        Self::new(
            RetryConfig::new(
                MAX_RETRIES,
                Duration::from_secs(BACKOFF_BASE_SECS),
                Duration::from_secs(MAX_RETRY_DELAY_SECS),
            ),
            MonitorTiming::default(),
        )
    }
}

impl MonitorRegistry {
    pub fn new(connect_retry: RetryConfig, timing: MonitorTiming) -> Self {
        Self {
            monitors: RwLock::new(HashMap::new()),
            connect_retry,
            timing,
        }
    }

    /// Connect `client` (with retries) and spawn a monitor loop for `folder`.
    pub async fn start(
        &self,
        id: &str,
        client: Arc<ImapClient>,
        folder: &str,
        callback: NewMessageCallback,
    ) -> Result<()> {
        if self.is_monitoring(id).await {
            return Err(ImapError::AlreadyMonitoring(id.to_string()).into());
        }

        with_retry(&self.connect_retry, || client.connect()).await?;

        let monitor = Arc::new(MailboxMonitor::new(
            client,
            folder,
            callback,
            self.timing.clone(),
        ));
        let task = {
            let monitor = monitor.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = monitor.run().await {
                    tracing::error!("Monitor '{}' ended: {:#}", id, e);
                }
            })
        };

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(id.to_string(), MonitorEntry { monitor, task }) {
            old.monitor.stop();
        }
        tracing::info!("Started monitor '{}'", id);
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn stop(&self, id: &str) -> bool {
        let entry = self.monitors.write().await.remove(id);
        match entry {
            Some(entry) => {
                entry.monitor.stop();
                tracing::info!("Stopping monitor '{}'", id);
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let entries: Vec<(String, MonitorEntry)> = self.monitors.write().await.drain().collect();
        for (id, entry) in entries {
            entry.monitor.stop();
            tracing::info!("Stopping monitor '{}'", id);
        }
    }

    pub async fn is_monitoring(&self, id: &str) -> bool {
        self.monitors
            .read()
            .await
            .get(id)
            .is_some_and(|e| e.monitor.state() != MonitorState::Stopped && !e.task.is_finished())
    }

    pub async fn state(&self, id: &str) -> Option<MonitorState> {
        self.monitors.read().await.get(id).map(|e| e.monitor.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::imap::testing::{FakeServer, simple_message};
    use crate::mail::types::EmailFlags;
    use tokio::sync::mpsc;

    fn fast_timing() -> MonitorTiming {
        MonitorTiming {
            idle_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_millis(20),
            max_retries: 3,
        }
    }

    fn channel_callback() -> (NewMessageCallback, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: NewMessageCallback = Arc::new(move |message| {
            let tx = tx.clone();
            Box::pin(async move {
                tx.send(message).ok();
            })
        });
        (callback, rx)
    }

    async fn wait_for_state(monitor: &MailboxMonitor, wanted: MonitorState) {
        let mut rx = monitor.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_baseline_then_new_mail_via_idle() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        server.append("INBOX", EmailFlags::empty(), simple_message("old"));
        let client = Arc::new(server.client("acct"));
        client.connect().await.unwrap();

        let (callback, mut rx) = channel_callback();
        let monitor = Arc::new(MailboxMonitor::new(client, "INBOX", callback, fast_timing()));
        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });

        wait_for_state(&monitor, MonitorState::Idle { watching: true }).await;
        assert!(rx.try_recv().is_err(), "pre-existing mail must not be delivered");

        server.append("INBOX", EmailFlags::empty(), simple_message("fresh"));
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.subject, "fresh");
        assert_eq!(delivered.uid, 2);

        monitor.stop();
        task.await.unwrap().unwrap();
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_polling_without_idle() {
        let server = FakeServer::new();
        server.disable_idle();
        server.add_folder("INBOX", 1);
        let client = Arc::new(server.client("acct"));
        client.connect().await.unwrap();

        let (callback, mut rx) = channel_callback();
        let monitor = Arc::new(MailboxMonitor::new(client, "INBOX", callback, fast_timing()));
        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });

        wait_for_state(&monitor, MonitorState::Polling).await;
        server.append("INBOX", EmailFlags::empty(), simple_message("polled"));
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.subject, "polled");

        monitor.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let server = FakeServer::new();
        // Folder does not exist: every cycle fails with a protocol error
        let client = Arc::new(server.client("acct"));
        let (callback, _rx) = channel_callback();
        let monitor = MailboxMonitor::new(client, "Missing", callback, fast_timing());

        let err = tokio::time::timeout(Duration::from_secs(2), monitor.run())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ImapError>(),
            Some(ImapError::MaxRetriesExceeded)
        ));
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_recovers_after_transport_failures() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let client = Arc::new(server.client("acct"));
        client.connect().await.unwrap();
        // Two consecutive failures defeat the one-shot retry once
        server.fail_next("connection reset");
        server.fail_next("connection reset");

        let (callback, mut rx) = channel_callback();
        let monitor = Arc::new(MailboxMonitor::new(client, "INBOX", callback, fast_timing()));
        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });

        wait_for_state(&monitor, MonitorState::Idle { watching: true }).await;
        server.append("INBOX", EmailFlags::empty(), simple_message("after"));
        let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.subject, "after");

        monitor.stop();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        server.fail_connects(2);
        let registry = MonitorRegistry::new(
            RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            fast_timing(),
        );
        let (callback, _rx) = channel_callback();
        let client = Arc::new(server.client("acct"));

        registry
            .start("imap-acct", client.clone(), "INBOX", callback.clone())
            .await
            .unwrap();
        assert!(registry.is_monitoring("imap-acct").await);
        assert_eq!(server.connects(), 1);

        let again = registry
            .start("imap-acct", client, "INBOX", callback)
            .await
            .unwrap_err();
        assert!(matches!(
            again.downcast_ref::<ImapError>(),
            Some(ImapError::AlreadyMonitoring(_))
        ));

        assert!(registry.stop("imap-acct").await);
        assert!(!registry.is_monitoring("imap-acct").await);
        assert!(!registry.stop("imap-acct").await);
        registry.stop_all().await;
    }
}
