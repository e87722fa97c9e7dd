use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::SyncError;
use crate::events::EventHandler;
use crate::mail::imap::ImapClient;
use crate::mail::types::{Folder, FolderAttributes, RemoteFolder, SpecialUse};

/// Policy for one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct FolderSyncOptions {
    pub account_id: String,
    /// Create local-only folders on the server
    pub create_missing: bool,
    /// Delete local-only folders (and their messages) from the store
    pub delete_extra: bool,
    /// Subscribe folders created on the server by this pass
    pub subscribe_new: bool,
}

impl FolderSyncOptions {
    /// Pull server folders into the store without touching anything else.
    pub fn non_destructive(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created_local: Vec<String>,
    pub created_remote: Vec<String>,
    pub deleted_local: Vec<String>,
    /// Server folders as classified during this pass
    pub folders: Vec<Folder>,
}

fn special_use_from_name(name: &str) -> SpecialUse {
    let lower = name.to_lowercase();
    if lower == "inbox" {
        return SpecialUse::INBOX;
    }

    let mut special = SpecialUse::empty();
    if lower.contains("sent") {
        special |= SpecialUse::SENT;
    }
    if lower.contains("trash") || lower.contains("deleted") {
        special |= SpecialUse::TRASH;
    }
    if lower.contains("draft") {
        special |= SpecialUse::DRAFTS;
    }
    if lower.contains("junk") || lower.contains("spam") {
        special |= SpecialUse::JUNK;
    }
    if lower.contains("archive") {
        special |= SpecialUse::ARCHIVE;
    }
    if lower.contains("important") || lower.contains("starred") {
        special |= SpecialUse::IMPORTANT;
    }
    special
}

fn special_use_from_attributes(attributes: FolderAttributes) -> SpecialUse {
    [
        (FolderAttributes::SENT, SpecialUse::SENT),
        (FolderAttributes::TRASH, SpecialUse::TRASH),
        (FolderAttributes::DRAFTS, SpecialUse::DRAFTS),
        (FolderAttributes::JUNK, SpecialUse::JUNK),
        (FolderAttributes::ARCHIVE, SpecialUse::ARCHIVE),
    ]
    .into_iter()
    .filter(|(attr, _)| attributes.contains(*attr))
    .fold(SpecialUse::empty(), |acc, (_, special)| acc | special)
}

/// Turn a LIST entry into a folder.
///
/// Server-advertised special-use attributes replace the name-based guess;
/// `\Marked` adds IMPORTANT and `\Noselect` clears selectability.
pub fn classify_folder(account_id: &str, remote: &RemoteFolder) -> Folder {
    let advertised = special_use_from_attributes(remote.attributes);
    let mut special_use = if advertised.is_empty() {
        special_use_from_name(&remote.name)
    } else {
        advertised
    };
    if remote.name.eq_ignore_ascii_case("inbox") {
        special_use |= SpecialUse::INBOX;
    }
    if remote.attributes.contains(FolderAttributes::MARKED) {
        special_use |= SpecialUse::IMPORTANT;
    }

    Folder {
        account_id: account_id.to_string(),
        name: remote.name.clone(),
        delimiter: remote.delimiter.clone(),
        special_use,
        selectable: !remote.attributes.contains(FolderAttributes::NO_SELECT),
        subscribed: remote.subscribed,
        has_children: remote.attributes.contains(FolderAttributes::HAS_CHILDREN),
    }
}

/// Keeps one account's local folder list in line with the server.
#[derive(Clone)]
pub struct FolderReconciler {
    client: Arc<ImapClient>,
    events: EventHandler,
}

impl FolderReconciler {
    pub fn new(client: Arc<ImapClient>, events: EventHandler) -> Self {
        Self { client, events }
    }

    pub fn account_id(&self) -> &str {
        self.client.account_id()
    }

    /// Server folders, classified.
    pub async fn server_folders(&self) -> Result<Vec<Folder>> {
        let remote = self.client.list_folders().await?;
        Ok(remote
            .iter()
            .map(|r| classify_folder(self.client.account_id(), r))
            .collect())
    }

    pub async fn reconcile(&self, options: &FolderSyncOptions) -> Result<ReconcileReport> {
        if options.account_id.trim().is_empty() {
            return Err(SyncError::MissingAccountId.into());
        }
        let account_id = options.account_id.as_str();

        let server = self
            .server_folders()
            .await
            .with_context(|| format!("Failed to list folders for '{}'", account_id))?;
        let local: BTreeSet<String> = self
            .events
            .store()
            .get_folders(account_id)
            .await?
            .into_iter()
            .map(|f| f.name)
            .collect();
        let server_names: BTreeSet<&str> = server.iter().map(|f| f.name.as_str()).collect();

        let mut report = ReconcileReport::default();
        for folder in server.iter().filter(|f| !local.contains(&f.name)) {
            self.events.handle_folder_created(folder).await?;
            report.created_local.push(folder.name.clone());
        }

        let local_only: Vec<&String> = local
            .iter()
            .filter(|name| !server_names.contains(name.as_str()))
            .collect();

        if options.create_missing {
            for name in &local_only {
                self.client
                    .create_folder(name)
                    .await
                    .with_context(|| format!("Failed to create '{}' on the server", name))?;
                report.created_remote.push(name.to_string());

                if options.subscribe_new
                    && let Err(e) = self.client.subscribe(name).await
                {
                    tracing::warn!("Failed to subscribe '{}' for '{}': {:#}", name, account_id, e);
                }
            }
        }

        if options.delete_extra {
            for name in local_only
                .iter()
                .filter(|name| !report.created_remote.contains(**name))
            {
                self.events.handle_folder_deleted(account_id, name).await?;
                report.deleted_local.push(name.to_string());
            }
        }

        tracing::info!(
            "Folders for '{}': {} on server, {} created locally, {} created remotely, {} deleted",
            account_id,
            server.len(),
            report.created_local.len(),
            report.created_remote.len(),
            report.deleted_local.len()
        );
        self.events
            .publish_folders_synced(account_id, server.clone())
            .await;
        report.folders = server;
        Ok(report)
    }

    //
    // Folder operations: server first, then the store
    //

    pub async fn create_folder(&self, name: &str) -> Result<()> {
        self.client.create_folder(name).await?;
        self.events
            .handle_folder_created(&Folder::new(self.client.account_id(), name))
            .await
    }

    pub async fn rename_folder(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.client.rename_folder(old_name, new_name).await?;
        self.events
            .handle_folder_renamed(self.client.account_id(), old_name, new_name)
            .await
    }

    pub async fn delete_folder(&self, name: &str) -> Result<()> {
        self.client.delete_folder(name).await?;
        self.events
            .handle_folder_deleted(self.client.account_id(), name)
            .await
    }

    pub async fn subscribe(&self, name: &str) -> Result<()> {
        self.client.subscribe(name).await
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.client.unsubscribe(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Dispatcher, EventKind, channel_subscriber, drain};
    use crate::mail::imap::testing::FakeServer;
    use crate::store::{MailStore, SqliteStore};

    fn remote(name: &str, attributes: FolderAttributes) -> RemoteFolder {
        RemoteFolder {
            name: name.to_string(),
            delimiter: Some("/".to_string()),
            attributes,
            subscribed: false,
        }
    }

    #[test]
    fn test_classify_by_name() {
        let cases = [
            ("INBOX", SpecialUse::INBOX),
            ("Sent Items", SpecialUse::SENT),
            ("Deleted Messages", SpecialUse::TRASH),
            ("Drafts", SpecialUse::DRAFTS),
            ("Spam", SpecialUse::JUNK),
            ("Archive/2023", SpecialUse::ARCHIVE),
            ("[Gmail]/Starred", SpecialUse::IMPORTANT),
            ("Projects", SpecialUse::empty()),
        ];
        for (name, expected) in cases {
            let folder = classify_folder("acct", &remote(name, FolderAttributes::empty()));
            assert_eq!(folder.special_use, expected, "{}", name);
            assert!(folder.selectable);
        }
    }

    #[test]
    fn test_attributes_override_name() {
        // Localized name the heuristics cannot read
        let folder = classify_folder("acct", &remote("Papierkorb", FolderAttributes::TRASH));
        assert_eq!(folder.special_use, SpecialUse::TRASH);

        // Advertised role wins over a misleading name
        let folder = classify_folder("acct", &remote("Sent Archive", FolderAttributes::ARCHIVE));
        assert_eq!(folder.special_use, SpecialUse::ARCHIVE);

        let folder = classify_folder(
            "acct",
            &remote(
                "[Gmail]",
                FolderAttributes::NO_SELECT | FolderAttributes::HAS_CHILDREN | FolderAttributes::MARKED,
            ),
        );
        assert!(!folder.selectable);
        assert!(folder.has_children);
        assert!(folder.special_use.contains(SpecialUse::IMPORTANT));
    }

    async fn setup(server: &FakeServer) -> (FolderReconciler, Arc<SqliteStore>, tokio::sync::mpsc::UnboundedReceiver<crate::events::MailEvent>) {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let dispatcher = Arc::new(Dispatcher::new());
        let (subscriber, rx) = channel_subscriber();
        dispatcher.subscribe_all(subscriber).await;
        let events = EventHandler::new(store.clone(), dispatcher);
        (
            FolderReconciler::new(Arc::new(server.client("acct")), events),
            store,
            rx,
        )
    }

    async fn local_names(store: &SqliteStore) -> Vec<String> {
        let mut names: Vec<String> = store
            .get_folders("acct")
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_server_only_folders_created_locally() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        server.add_folder("Sent", 1);
        server.subscribe_folder("INBOX");
        let (reconciler, store, mut rx) = setup(&server).await;

        let report = reconciler
            .reconcile(&FolderSyncOptions::non_destructive("acct"))
            .await
            .unwrap();
        assert_eq!(report.created_local, vec!["INBOX", "Sent"]);
        assert_eq!(local_names(&store).await, vec!["INBOX", "Sent"]);

        let inbox = store
            .get_folders("acct")
            .await
            .unwrap()
            .into_iter()
            .find(|f| f.name == "INBOX")
            .unwrap();
        assert!(inbox.subscribed);
        assert_eq!(inbox.special_use, SpecialUse::INBOX);

        let kinds: Vec<EventKind> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::FolderCreated,
                EventKind::FolderCreated,
                EventKind::FolderSynced
            ]
        );

        // Second pass changes nothing
        let report = reconciler
            .reconcile(&FolderSyncOptions::non_destructive("acct"))
            .await
            .unwrap();
        assert!(report.created_local.is_empty());
    }

    #[tokio::test]
    async fn test_create_missing_and_subscribe() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let (reconciler, store, _rx) = setup(&server).await;
        store.create_folder(&Folder::new("acct", "Local")).await.unwrap();

        let options = FolderSyncOptions {
            account_id: "acct".to_string(),
            create_missing: true,
            delete_extra: true,
            subscribe_new: true,
        };
        let report = reconciler.reconcile(&options).await.unwrap();

        assert_eq!(report.created_remote, vec!["Local"]);
        // Created on the server, so not extra any more
        assert!(report.deleted_local.is_empty());
        assert!(server.has_folder("Local"));
        assert!(server.is_subscribed("Local"));
        assert_eq!(local_names(&store).await, vec!["INBOX", "Local"]);
    }

    #[tokio::test]
    async fn test_delete_extra_removes_local_folder() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let (reconciler, store, _rx) = setup(&server).await;
        store.create_folder(&Folder::new("acct", "Gone")).await.unwrap();

        let options = FolderSyncOptions {
            account_id: "acct".to_string(),
            delete_extra: true,
            ..Default::default()
        };
        let report = reconciler.reconcile(&options).await.unwrap();
        assert_eq!(report.deleted_local, vec!["Gone"]);
        assert!(!server.has_folder("Gone"));
        assert_eq!(local_names(&store).await, vec!["INBOX"]);

        let err = reconciler
            .reconcile(&FolderSyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::MissingAccountId)
        ));
    }

    #[tokio::test]
    async fn test_folder_operations_reach_server_and_store() {
        let server = FakeServer::new();
        server.add_folder("INBOX", 1);
        let (reconciler, store, mut rx) = setup(&server).await;

        reconciler.create_folder("Projects").await.unwrap();
        reconciler.subscribe("Projects").await.unwrap();
        assert!(server.is_subscribed("Projects"));
        reconciler.rename_folder("Projects", "Work").await.unwrap();
        assert!(server.has_folder("Work"));
        assert!(server.is_subscribed("Work"));
        assert_eq!(local_names(&store).await, vec!["Work"]);

        reconciler.unsubscribe("Work").await.unwrap();
        reconciler.delete_folder("Work").await.unwrap();
        assert!(!server.has_folder("Work"));
        assert!(local_names(&store).await.is_empty());

        let kinds: Vec<EventKind> = drain(&mut rx).await.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::FolderCreated,
                EventKind::FolderRenamed,
                EventKind::FolderDeleted
            ]
        );

        // Server refuses: nothing changes locally
        assert!(reconciler.delete_folder("Missing").await.is_err());
    }
}
