//! Server to store synchronization.
//!
//! - `mod.rs` - `Synchronizer`: per-folder full/incremental decision and cursor handling
//! - `batch.rs` - Batched bulk fetch with bounded parse-and-store fan-out
//! - `status.rs` - Read-state and vanished-message detection
//! - `folders.rs` - Folder classification, reconciliation and folder operations
//! - `folder_watcher.rs` - Periodic folder reconciliation for every account

mod batch;
mod folder_watcher;
mod folders;
mod status;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::constants::{DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
use crate::events::EventHandler;
use crate::mail::imap::{ImapClient, ImapError, is_missing_mailbox};
use crate::mail::types::{Folder, SearchCriteria};
use crate::store::SyncStatus;

use batch::BatchContext;

pub use folder_watcher::FolderWatcher;
pub use folders::{FolderReconciler, FolderSyncOptions, classify_folder};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("account id is required")]
    MissingAccountId,
}

/// Called with `(folder, processed, total)` after every batch.
pub type ProgressCallback = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

#[derive(Clone)]
pub struct SyncOptions {
    pub account_id: String,
    /// `None` syncs every selectable folder
    pub folder: Option<String>,
    pub batch_size: usize,
    /// Keep only the most recent N messages of a search; zero means unbounded
    pub max_emails: usize,
    /// Store attachment metadata rows. Bodies are never transferred.
    pub sync_attachments: bool,
    pub since: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    pub on_progress: Option<ProgressCallback>,
}

impl SyncOptions {
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            folder: None,
            batch_size: DEFAULT_BATCH_SIZE,
            max_emails: 0,
            sync_attachments: false,
            since: None,
            before: None,
            on_progress: None,
        }
    }

    pub fn folder(mut self, folder: &str) -> Self {
        self.folder = Some(folder.to_string());
        self
    }

    /// Out of range batch sizes fall back to the default.
    fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.account_id.trim().is_empty() {
            return Err(SyncError::MissingAccountId);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct IncrementalSyncOptions {
    pub sync: SyncOptions,
    pub check_status_changes: bool,
}

impl IncrementalSyncOptions {
    pub fn new(account_id: &str) -> Self {
        Self {
            sync: SyncOptions::new(account_id),
            check_status_changes: true,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub folders: usize,
    pub full_syncs: usize,
    /// Messages fetched and stored
    pub fetched: usize,
    /// Messages dropped because the folder's UID validity changed
    pub purged: usize,
    pub status_changes: usize,
    pub removed: usize,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.folders += other.folders;
        self.full_syncs += other.full_syncs;
        self.fetched += other.fetched;
        self.purged += other.purged;
        self.status_changes += other.status_changes;
        self.removed += other.removed;
    }
}

/// Brings the store in line with one account's server.
pub struct Synchronizer {
    client: Arc<ImapClient>,
    events: EventHandler,
}

impl Synchronizer {
    pub fn new(client: Arc<ImapClient>, events: EventHandler) -> Self {
        Self { client, events }
    }

    /// Sync without status checks. Folders with a valid cursor still sync incrementally.
    pub async fn sync(&self, options: &SyncOptions) -> Result<SyncReport> {
        self.run(options, false).await
    }

    pub async fn sync_incremental(&self, options: &IncrementalSyncOptions) -> Result<SyncReport> {
        self.run(&options.sync, options.check_status_changes).await
    }

    /// Forget the cursor of `folder` so the next pass is a full sync.
    pub async fn reset_folder(&self, folder: &str) -> Result<()> {
        self.events
            .store()
            .delete_sync_status(self.client.account_id(), folder)
            .await
    }

    async fn run(&self, options: &SyncOptions, check_status: bool) -> Result<SyncReport> {
        options.validate()?;
        let folders = match &options.folder {
            Some(folder) if !folder.is_empty() => vec![folder.clone()],
            _ => self.selectable_folders().await?,
        };

        let mut report = SyncReport::default();
        for folder in &folders {
            let folder_report = self
                .sync_folder(folder, options, check_status)
                .await
                .with_context(|| {
                    format!("Failed to sync '{}' for '{}'", folder, options.account_id)
                })?;
            report.merge(folder_report);
        }

        tracing::info!(
            "Synced {} folder(s) for '{}': {} fetched, {} status change(s), {} removed",
            report.folders,
            options.account_id,
            report.fetched,
            report.status_changes,
            report.removed
        );
        Ok(report)
    }

    async fn selectable_folders(&self) -> Result<Vec<String>> {
        let folders = self.client.list_folders().await?;
        Ok(folders
            .into_iter()
            .map(|remote| classify_folder(self.client.account_id(), &remote))
            .filter(|folder| folder.selectable)
            .map(|folder| folder.name)
            .collect())
    }

    async fn sync_folder(
        &self,
        folder: &str,
        options: &SyncOptions,
        check_status: bool,
    ) -> Result<SyncReport> {
        let account_id = self.client.account_id();
        let store = self.events.store();

        let status = match self.client.select(folder).await {
            Ok(status) => status,
            Err(e) if is_missing_mailbox(&e) => {
                tracing::debug!("SELECT '{}' for '{}' failed: {:#}", folder, account_id, e);
                return Err(ImapError::MailboxNotFound(folder.to_string()).into());
            }
            Err(e) => return Err(e),
        };
        let uid_validity = status
            .uid_validity
            .ok_or_else(|| ImapError::MissingUidValidity(folder.to_string()))?;

        self.ensure_local_folder(folder).await?;

        let mut report = SyncReport {
            folders: 1,
            ..Default::default()
        };
        let ctx = BatchContext {
            client: &self.client,
            events: &self.events,
            folder,
            batch_size: options.effective_batch_size(),
            keep_attachments: options.sync_attachments,
            progress: options.on_progress.as_ref(),
        };

        let mut cursor = match store.get_sync_status(account_id, folder).await? {
            Some(cursor) if !cursor.needs_full_sync(uid_validity) && cursor.is_complete() => cursor,
            Some(cursor) if !cursor.needs_full_sync(uid_validity) => {
                // An earlier full sync stopped part way: keep its committed batches
                tracing::info!(
                    "Resuming full sync of '{}' for '{}' above UID {}",
                    folder,
                    account_id,
                    cursor.last_uid
                );
                report.full_syncs = 1;
                report.fetched = self.full_sync(&ctx, options, cursor).await?;
                return Ok(report);
            }
            previous => {
                if let Some(old) = previous.as_ref().and_then(|c| c.uid_validity)
                    && old != uid_validity
                {
                    report.purged = self.events.handle_folder_purged(account_id, folder).await?;
                    tracing::warn!(
                        "UID validity of '{}' for '{}' changed {} -> {}, dropped {} message(s)",
                        folder,
                        account_id,
                        old,
                        uid_validity,
                        report.purged
                    );
                }
                let mut cursor = SyncStatus::new(account_id, folder);
                cursor.uid_validity = Some(uid_validity);
                store.update_sync_status(&cursor).await?;

                report.full_syncs = 1;
                report.fetched = self.full_sync(&ctx, options, cursor).await?;
                return Ok(report);
            }
        };

        // Incremental: only UIDs above the cursor
        let uids = self
            .client
            .search_uids(folder, &SearchCriteria::uids_from(cursor.next_uid()))
            .await?;
        let uids = keep_recent(uids, options.max_emails);
        let highest = uids.last().copied();
        // The mailbox monitor may already have stored some of these
        let stored = self.stored_uids(folder).await?;
        let missing: Vec<u32> = uids.into_iter().filter(|uid| !stored.contains(uid)).collect();
        report.fetched = ctx.ingest(&missing, &mut cursor).await?;
        if let Some(highest) = highest {
            cursor.advance(highest);
        }

        if check_status {
            let outcome = status::detect_changes(&self.client, &self.events, folder).await?;
            report.status_changes = outcome.changed;
            report.removed = outcome.removed;
        }

        cursor.last_sync = Some(Utc::now());
        store.update_sync_status(&cursor).await?;
        Ok(report)
    }

    /// Fetch the whole folder above `cursor.last_uid` and mark the cursor complete.
    ///
    /// `last_sync` stays unset until every batch is in. A later pass with the
    /// same UID validity resumes after the last committed batch.
    async fn full_sync(
        &self,
        ctx: &BatchContext<'_>,
        options: &SyncOptions,
        mut cursor: SyncStatus,
    ) -> Result<usize> {
        let account_id = self.client.account_id();
        let criteria = SearchCriteria {
            since: options.since,
            before: options.before,
            ..Default::default()
        };
        let uids = self.client.search_uids(ctx.folder, &criteria).await?;
        let mut uids = keep_recent(uids, options.max_emails);
        if cursor.last_uid > 0 {
            // Resuming: skip committed batches and anything the monitor stored since
            let stored = self.stored_uids(ctx.folder).await?;
            uids.retain(|uid| *uid > cursor.last_uid && !stored.contains(uid));
        }
        tracing::info!(
            "Full sync of '{}' for '{}': {} message(s)",
            ctx.folder,
            account_id,
            uids.len()
        );

        let fetched = ctx.ingest(&uids, &mut cursor).await?;

        cursor.last_sync = Some(Utc::now());
        self.events.store().update_sync_status(&cursor).await?;
        Ok(fetched)
    }

    async fn stored_uids(&self, folder: &str) -> Result<HashSet<u32>> {
        Ok(self
            .events
            .store()
            .message_states(self.client.account_id(), folder)
            .await?
            .into_iter()
            .map(|s| s.uid)
            .collect())
    }

    async fn ensure_local_folder(&self, folder: &str) -> Result<()> {
        let account_id = self.client.account_id();
        let known = self.events.store().get_folders(account_id).await?;
        if known.iter().any(|f| f.name == folder) {
            return Ok(());
        }
        self.events
            .handle_folder_created(&Folder::new(account_id, folder))
            .await
    }
}

/// Keep the `max` highest UIDs of an ascending list; zero keeps all.
fn keep_recent(mut uids: Vec<u32>, max: usize) -> Vec<u32> {
    uids.sort_unstable();
    if max > 0 && uids.len() > max {
        uids.drain(..uids.len() - max);
    }
    uids
}
