use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::folders::{FolderReconciler, FolderSyncOptions, ReconcileReport};
use crate::constants::FOLDER_SYNC_INTERVAL_MINS;

/// Periodically reconciles the folder list of every registered account.
pub struct FolderWatcher {
    reconcilers: RwLock<HashMap<String, FolderReconciler>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    running: Mutex<bool>,
    interval: Duration,
    create_missing: bool,
}

impl FolderWatcher {
    pub fn new(interval: Duration, create_missing: bool) -> Self {
        Self {
            reconcilers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
            interval,
            create_missing,
        }
    }

    #[allow(dead_code)]
    pub fn with_default_interval(create_missing: bool) -> Self {
        Self::new(
            Duration::from_secs(FOLDER_SYNC_INTERVAL_MINS * 60),
            create_missing,
        )
    }

    fn options(&self, account_id: &str) -> FolderSyncOptions {
        FolderSyncOptions {
            account_id: account_id.to_string(),
            create_missing: self.create_missing,
            delete_extra: false,
            subscribe_new: false,
        }
    }

    /// Add an account; it starts being watched right away if the watcher runs.
    pub async fn register(&self, reconciler: FolderReconciler) {
        let account_id = reconciler.account_id().to_string();
        self.reconcilers
            .write()
            .await
            .insert(account_id.clone(), reconciler.clone());
        if *self.running.lock().await {
            self.spawn_account(account_id, reconciler).await;
        }
    }

    #[allow(dead_code)]
    pub async fn unregister(&self, account_id: &str) {
        if let Some(task) = self.tasks.lock().await.remove(account_id) {
            task.abort();
        }
        self.reconcilers.write().await.remove(account_id);
    }

    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if *running {
            return;
        }
        *running = true;
        let reconcilers: Vec<(String, FolderReconciler)> = self
            .reconcilers
            .read()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        for (account_id, reconciler) in reconcilers {
            self.spawn_account(account_id, reconciler).await;
        }
        tracing::info!("Folder watcher started, interval {:?}", self.interval);
    }

    pub async fn stop(&self) {
        *self.running.lock().await = false;
        for (_, task) in self.tasks.lock().await.drain() {
            task.abort();
        }
    }

    async fn spawn_account(&self, account_id: String, reconciler: FolderReconciler) {
        let options = self.options(&account_id);
        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // First tick fires immediately
                ticker.tick().await;
                if let Err(e) = reconciler.reconcile(&options).await {
                    tracing::warn!(
                        "Folder sync for '{}' failed: {:#}",
                        options.account_id,
                        e
                    );
                }
            }
        });
        if let Some(old) = self.tasks.lock().await.insert(account_id, task) {
            old.abort();
        }
    }

    /// Reconcile one account now.
    pub async fn sync_account(&self, account_id: &str) -> Result<ReconcileReport> {
        let reconciler = self
            .reconcilers
            .read()
            .await
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow!("no folder sync registered for account '{}'", account_id))?;
        reconciler.reconcile(&self.options(account_id)).await
    }

    /// Reconcile every account concurrently. Returns how many succeeded.
    #[allow(dead_code)]
    pub async fn sync_all(&self) -> usize {
        let reconcilers: Vec<FolderReconciler> =
            self.reconcilers.read().await.values().cloned().collect();
        let results = join_all(reconcilers.iter().map(|r| async move {
            let options = self.options(r.account_id());
            (r.account_id(), r.reconcile(&options).await)
        }))
        .await;

        results
            .into_iter()
            .filter(|(account_id, result)| match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Folder sync for '{}' failed: {:#}", account_id, e);
                    false
                }
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::events::{Dispatcher, EventHandler};
    use crate::mail::imap::testing::FakeServer;
    use crate::store::{MailStore, SqliteStore};

    async fn reconciler(server: &FakeServer, account_id: &str, store: Arc<SqliteStore>) -> FolderReconciler {
        let events = EventHandler::new(store, Arc::new(Dispatcher::new()));
        FolderReconciler::new(Arc::new(server.client(account_id)), events)
    }

    async fn has_local(store: &SqliteStore, account_id: &str, name: &str) -> bool {
        store
            .get_folders(account_id)
            .await
            .unwrap()
            .iter()
            .any(|f| f.name == name)
    }

    async fn wait_for_local(store: &SqliteStore, name: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !has_local(store, "acct", name).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("folder never appeared locally");
    }

    #[tokio::test]
    async fn test_periodic_reconcile_until_stopped() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let watcher = FolderWatcher::new(Duration::from_millis(30), false);
        watcher.register(reconciler(&server, "acct", store.clone()).await).await;

        watcher.start().await;
        wait_for_local(&store, "INBOX").await;

        server.add_folder("Receipts", 1);
        wait_for_local(&store, "Receipts").await;

        watcher.stop().await;
        server.add_folder("Later", 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!has_local(&store, "acct", "Later").await);
    }

    #[tokio::test]
    async fn test_on_demand_sync() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        store.create_folder(&crate::mail::types::Folder::new("a", "Local")).await.unwrap();

        let watcher = FolderWatcher::with_default_interval(true);
        watcher.register(reconciler(&server, "a", store.clone()).await).await;
        watcher.register(reconciler(&server, "b", store.clone()).await).await;

        let report = watcher.sync_account("a").await.unwrap();
        // create_missing pushes the local-only folder to the server
        assert_eq!(report.created_remote, vec!["Local"]);
        assert!(server.has_folder("Local"));

        assert_eq!(watcher.sync_all().await, 2);
        assert!(has_local(&store, "b", "Local").await);
        assert!(watcher.sync_account("c").await.is_err());

        watcher.unregister("b").await;
        assert_eq!(watcher.sync_all().await, 1);
    }
}
