use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::handle::AccountHandle;
use crate::config::{BridgeConfig, Config, SyncConfig};
use crate::connection::{ConnectionManager, HealthWatcher, ManagedConnection};
use crate::credentials::{CredentialCipher, open_account};
use crate::events::EventHandler;
use crate::mail::imap::MonitorRegistry;
use crate::sync::{FolderSyncOptions, FolderWatcher};

/// Owns every account and the services that keep them in sync.
pub struct AccountManager {
    handles: Vec<Arc<AccountHandle>>,
    bridge: BridgeConfig,
    sync: SyncConfig,
    connections: Arc<ConnectionManager>,
    monitors: Arc<MonitorRegistry>,
    folder_watcher: Arc<FolderWatcher>,
    health: Arc<HealthWatcher>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AccountManager {
    /// Decrypt every account's secrets and build its clients.
    pub async fn new(
        config: &Config,
        cipher: &dyn CredentialCipher,
        events: EventHandler,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(config.accounts.len());
        for account in &config.accounts {
            let mut account = account.clone();
            open_account(&mut account, cipher)?;
            handles.push(AccountHandle::new(account, events.clone())?);
        }
        Ok(Self::assemble(
            handles,
            config.bridge.clone(),
            config.sync.clone(),
            Arc::new(ConnectionManager::default()),
        )
        .await)
    }

    /// Register `handles` with the connection, folder and health services.
    pub(crate) async fn assemble(
        handles: Vec<AccountHandle>,
        bridge: BridgeConfig,
        sync: SyncConfig,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let handles: Vec<Arc<AccountHandle>> = handles.into_iter().map(Arc::new).collect();
        let folder_watcher = Arc::new(FolderWatcher::new(
            Duration::from_secs(bridge.folder_sync_minutes * 60),
            sync.create_missing_folders,
        ));
        let health = Arc::new(HealthWatcher::new(
            connections.clone(),
            Duration::from_secs(bridge.health_check_secs),
        ));

        for handle in &handles {
            connections
                .register(&handle.imap_client_id(), handle.imap().clone())
                .await;
            if let Some(smtp) = handle.smtp() {
                let smtp: Arc<dyn ManagedConnection> = smtp.clone();
                connections.register(&handle.smtp_client_id(), smtp).await;
            }
            folder_watcher.register(handle.reconciler().clone()).await;
        }

        // Restored IMAP connections get their folder list reconciled
        let by_id: Arc<HashMap<String, Arc<AccountHandle>>> = Arc::new(
            handles
                .iter()
                .map(|h| (h.id().to_string(), h.clone()))
                .collect(),
        );
        connections
            .set_reconnect_hook(Arc::new(move |account_id: String| {
                let by_id = by_id.clone();
                async move {
                    let Some(handle) = by_id.get(&account_id) else {
                        return;
                    };
                    let options = FolderSyncOptions::non_destructive(&account_id);
                    if let Err(e) = handle.reconciler().reconcile(&options).await {
                        tracing::warn!(
                            "Folder sync after reconnect of '{}' failed: {:#}",
                            account_id,
                            e
                        );
                    }
                }
                .boxed()
            }))
            .await;

        Self {
            handles,
            bridge,
            sync,
            connections,
            monitors: Arc::new(MonitorRegistry::default()),
            folder_watcher,
            health,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.handles.len()
    }

    pub fn get(&self, account_id: &str) -> Option<&Arc<AccountHandle>> {
        self.handles.iter().find(|h| h.id() == account_id)
    }

    /// Get a handle or fail with the list of known accounts
    pub fn require(&self, account_id: &str) -> Result<&Arc<AccountHandle>> {
        self.get(account_id).ok_or_else(|| {
            let known: Vec<&str> = self.handles.iter().map(|h| h.id()).collect();
            anyhow!(
                "Unknown account '{}' (configured: {})",
                account_id,
                known.join(", ")
            )
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AccountHandle>> {
        self.handles.iter()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[allow(dead_code)]
    pub fn monitors(&self) -> &Arc<MonitorRegistry> {
        &self.monitors
    }

    pub fn folder_watcher(&self) -> &Arc<FolderWatcher> {
        &self.folder_watcher
    }

    /// Incremental sync of every account, concurrently. Returns how many succeeded.
    pub async fn sync_all(&self) -> usize {
        let results = join_all(self.handles.iter().map(|h| async move {
            (h.id(), h.sync_all(&self.sync).await)
        }))
        .await;

        results
            .into_iter()
            .filter(|(account_id, result)| match result {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Sync of '{}' failed: {:#}", account_id, e);
                    false
                }
            })
            .count()
    }

    /// Start supervision, watchers and one mailbox monitor per account.
    ///
    /// Accounts start concurrently. One whose monitor cannot start is handed to
    /// the reconnect queue.
    pub async fn start(&self) {
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(worker) = self.connections.start().await {
                tasks.push(worker);
            }
            tasks.push(self.health.clone().spawn());
        }
        self.folder_watcher.start().await;

        join_all(self.handles.iter().map(|h| self.start_account(h))).await;
        tracing::info!("Bridge running for {} account(s)", self.handles.len());
    }

    async fn start_account(&self, handle: &AccountHandle) {
        if let Some(smtp) = handle.smtp()
            && let Err(e) = smtp.connect().await
        {
            tracing::warn!("SMTP for '{}' unavailable: {:#}", handle.id(), e);
            self.schedule(&handle.smtp_client_id());
        }

        let started = self
            .monitors
            .start(
                &handle.imap_client_id(),
                handle.monitor_client().clone(),
                &self.bridge.monitor_folder,
                handle.new_message_callback(),
            )
            .await;
        if let Err(e) = started {
            tracing::error!("Monitor for '{}' did not start: {:#}", handle.id(), e);
            self.schedule(&handle.imap_client_id());
        }
    }

    fn schedule(&self, client_id: &str) {
        if let Err(e) = self.connections.schedule_reconnect(client_id) {
            tracing::warn!("Could not queue reconnect for '{}': {}", client_id, e);
        }
    }

    /// Stop monitors and watchers, then disconnect every client.
    pub async fn shutdown(&self) {
        self.monitors.stop_all().await;
        self.folder_watcher.stop().await;
        self.connections.shutdown().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::handle::tests::account;
    use crate::events::Dispatcher;
    use crate::mail::imap::MonitorState;
    use crate::mail::imap::testing::{FakeServer, simple_message};
    use crate::mail::types::EmailFlags;
    use crate::store::{MailStore, SqliteStore};

    struct Bridge {
        servers: Vec<FakeServer>,
        store: Arc<SqliteStore>,
        manager: AccountManager,
    }

    async fn bridge(ids: &[&str]) -> Bridge {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let events = EventHandler::new(store.clone(), Arc::new(Dispatcher::new()));
        let mut servers = Vec::new();
        let mut handles = Vec::new();
        for id in ids {
            let server = FakeServer::new();
            server.add_folder("INBOX", 1);
            handles.push(AccountHandle::with_connector(
                account(id),
                server.connector(),
                None,
                events.clone(),
            ));
            servers.push(server);
        }
        let manager = AccountManager::assemble(
            handles,
            BridgeConfig::default(),
            SyncConfig::default(),
            Arc::new(ConnectionManager::new(
                Duration::from_millis(10),
                Duration::from_millis(50),
            )),
        )
        .await;
        Bridge {
            servers,
            store,
            manager,
        }
    }

    #[tokio::test]
    async fn test_accounts_are_registered() {
        let bridge = bridge(&["a", "b"]).await;
        assert_eq!(bridge.manager.count(), 2);
        assert_eq!(
            bridge.manager.connections().ids().await,
            vec!["imap-a", "imap-b"]
        );
        assert!(bridge.manager.get("a").is_some());
        match bridge.manager.require("zzz") {
            Ok(_) => panic!("unknown account resolved"),
            Err(err) => assert!(err.to_string().contains("a, b")),
        }
    }

    #[tokio::test]
    async fn test_sync_all_keeps_going_past_failures() {
        let bridge = bridge(&["a", "b"]).await;
        bridge.servers[0].append("INBOX", EmailFlags::empty(), simple_message("one"));
        bridge.servers[1].fail_connects(5);

        assert_eq!(bridge.manager.sync_all().await, 1);
        assert_eq!(bridge.store.count_messages("a", "INBOX").await.unwrap(), 1);
        assert!(bridge.manager.get("b").unwrap().status().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_monitor_delivers_into_store() {
        let bridge = bridge(&["a"]).await;
        bridge.manager.start().await;
        assert!(bridge.manager.monitors().is_monitoring("imap-a").await);
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.manager.monitors().state("imap-a").await
                != Some(MonitorState::Idle { watching: true })
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("monitor never entered IDLE");

        bridge.servers[0].append("INBOX", EmailFlags::empty(), simple_message("live"));
        tokio::time::timeout(Duration::from_secs(2), async {
            while bridge.store.count_messages("a", "INBOX").await.unwrap() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("monitored message never stored");

        bridge.manager.shutdown().await;
        assert!(!bridge.manager.monitors().is_monitoring("imap-a").await);
    }

    #[tokio::test]
    async fn test_reconnect_reconciles_folders() {
        let bridge = bridge(&["a"]).await;
        bridge.servers[0].add_folder("Projects", 1);
        bridge.manager.connections().start().await;

        bridge.manager.connections().schedule_reconnect("imap-a").unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let folders = bridge.store.get_folders("a").await.unwrap();
                if folders.iter().any(|f| f.name == "Projects") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("folders were not reconciled after reconnect");
        bridge.manager.shutdown().await;
    }
}
