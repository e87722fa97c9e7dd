//! Batched fetch: one bulk FETCH per batch, parsed and stored by a bounded task pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::ProgressCallback;
use crate::constants::BATCH_CONCURRENCY;
use crate::events::EventHandler;
use crate::mail::imap::ImapClient;
use crate::mail::parser::parse_message;
use crate::mail::types::FetchedMessage;
use crate::store::SyncStatus;

/// Everything a batch run needs for one folder.
pub(crate) struct BatchContext<'a> {
    pub client: &'a ImapClient,
    pub events: &'a EventHandler,
    pub folder: &'a str,
    pub batch_size: usize,
    pub keep_attachments: bool,
    pub progress: Option<&'a ProgressCallback>,
}

impl BatchContext<'_> {
    fn report(&self, current: usize, total: usize) {
        if let Some(progress) = self.progress {
            progress(self.folder, current, total);
        }
    }

    /// Ingest `uids` in ascending batches, persisting `cursor` after each one.
    ///
    /// Progress is reported after every batch; an empty run reports `(0, 0)` once.
    pub async fn ingest(&self, uids: &[u32], cursor: &mut SyncStatus) -> Result<usize> {
        let total = uids.len();
        if total == 0 {
            self.report(0, 0);
            return Ok(0);
        }

        let store = self.events.store();
        let mut processed = 0;
        for (index, chunk) in uids.chunks(self.batch_size).enumerate() {
            let stored = self
                .process_batch(chunk)
                .await
                .with_context(|| format!("Batch {} of '{}' failed", index + 1, self.folder))?;
            processed += chunk.len();

            if let Some(&max) = chunk.iter().max() {
                cursor.advance(max);
            }
            store
                .update_sync_status(cursor)
                .await
                .with_context(|| format!("Failed to save cursor for '{}'", self.folder))?;

            tracing::debug!(
                "'{}' batch {}: {} stored, {}/{}",
                self.folder,
                index + 1,
                stored,
                processed,
                total
            );
            self.report(processed, total);
        }
        Ok(processed)
    }

    /// Fetch one batch and store it. The first parse or store failure aborts the batch.
    async fn process_batch(&self, uids: &[u32]) -> Result<usize> {
        let fetched = self.client.fetch_raw(self.folder, uids).await?;
        let account_id = self.client.account_id().to_string();
        let semaphore = Arc::new(Semaphore::new(BATCH_CONCURRENCY));
        let mut tasks = JoinSet::new();

        for raw in fetched {
            let permit = semaphore.clone().acquire_owned().await?;
            let events = self.events.clone();
            let account_id = account_id.clone();
            let folder = self.folder.to_string();
            let keep_attachments = self.keep_attachments;
            tasks.spawn(async move {
                let _permit = permit;
                store_fetched(&events, &account_id, &folder, &raw, keep_attachments).await
            });
        }

        let mut stored = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => stored += 1,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(e).context("Batch task panicked");
                }
            }
        }
        Ok(stored)
    }
}

async fn store_fetched(
    events: &EventHandler,
    account_id: &str,
    folder: &str,
    raw: &FetchedMessage,
    keep_attachments: bool,
) -> Result<()> {
    let mut message = parse_message(account_id, folder, raw)
        .with_context(|| format!("Failed to parse UID {} in '{}'", raw.uid, folder))?;
    if !keep_attachments {
        // has_attachments stays set; only the per-part metadata is dropped
        message.attachments.clear();
    }
    events.handle_new_message(message).await
}
