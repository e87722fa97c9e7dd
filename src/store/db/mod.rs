//! SQLite store for messages, folders and sync cursors.
//!
//! This module is split into:
//! - `mod.rs` - Store struct, connection pool, `MailStore` impl
//! - `schema.rs` - Database schema initialization
//! - `email.rs` - Message CRUD operations
//! - `folder.rs` - Folder and sync cursor operations
//! - `attachment.rs` - Attachment metadata

mod attachment;
mod email;
mod folder;
mod schema;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{MailStore, MessageState, StoreQuery, SyncStatus};
use crate::mail::types::{Attachment, Folder, Message};

/// Connection pool size. Batches write concurrently from several tasks.
const POOL_SIZE: u32 = 16;

const MESSAGE_CACHE_MAX_CAPACITY: u64 = 1000;
const MESSAGE_CACHE_TTL_SECS: u64 = 600;

type MessageCache = moka::future::Cache<String, Message>;

pub struct SqliteStore {
    pool: SqlitePool,
    /// L1 hot cache for fully loaded messages
    message_cache: MessageCache,
}

impl SqliteStore {
    fn create_message_cache() -> MessageCache {
        moka::future::Cache::builder()
            .max_capacity(MESSAGE_CACHE_MAX_CAPACITY)
            .time_to_live(Duration::from_secs(MESSAGE_CACHE_TTL_SECS))
            .build()
    }

    pub async fn open(path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(POOL_SIZE)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?;

        schema::init_schema(&pool).await?;

        Ok(Self {
            pool,
            message_cache: Self::create_message_cache(),
        })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to create in-memory connection pool")?;

        schema::init_schema(&pool).await?;

        Ok(Self {
            pool,
            message_cache: Self::create_message_cache(),
        })
    }

    /// Number of stored messages in a folder.
    pub async fn count_messages(&self, account_id: &str, folder: &str) -> Result<usize> {
        email::count_messages(&self.pool, account_id, folder).await
    }
}

#[async_trait]
impl MailStore for SqliteStore {
    //
    // Messages
    //

    async fn store_message(&self, message: &Message) -> Result<()> {
        email::insert_message(&self.pool, message)
            .await
            .with_context(|| format!("Failed to store message {}", message.id))?;
        self.message_cache.invalidate(&message.id).await;
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        if let Some(message) = self.message_cache.get(id).await {
            return Ok(Some(message));
        }

        let message = email::get_message(&self.pool, id).await?;
        if let Some(ref m) = message {
            self.message_cache.insert(id.to_string(), m.clone()).await;
        }
        Ok(message)
    }

    async fn search_messages(&self, query: &StoreQuery) -> Result<Vec<Message>> {
        email::search_messages(&self.pool, query).await
    }

    async fn message_states(&self, account_id: &str, folder: &str) -> Result<Vec<MessageState>> {
        email::message_states(&self.pool, account_id, folder).await
    }

    async fn update_status(&self, id: &str, is_read: bool) -> Result<bool> {
        let updated = email::update_status(&self.pool, id, is_read).await?;
        self.message_cache.invalidate(id).await;
        Ok(updated)
    }

    async fn move_message(&self, id: &str, folder: &str) -> Result<bool> {
        let moved = email::move_message(&self.pool, id, folder).await?;
        self.message_cache.invalidate(id).await;
        Ok(moved)
    }

    async fn delete_message(&self, id: &str) -> Result<bool> {
        let deleted = email::delete_message(&self.pool, id).await?;
        self.message_cache.invalidate(id).await;
        Ok(deleted)
    }

    async fn purge_folder(&self, account_id: &str, folder: &str) -> Result<usize> {
        let removed = email::purge_folder(&self.pool, account_id, folder).await?;
        self.message_cache.invalidate_all();
        tracing::debug!("Purged {} messages from '{}'", removed, folder);
        Ok(removed)
    }

    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>> {
        attachment::get_attachment(&self.pool, id).await
    }

    //
    // Folders
    //

    async fn create_folder(&self, folder: &Folder) -> Result<()> {
        folder::upsert_folder(&self.pool, folder).await
    }

    async fn rename_folder(&self, account_id: &str, old_name: &str, new_name: &str) -> Result<()> {
        folder::rename_folder(&self.pool, account_id, old_name, new_name).await?;
        self.message_cache.invalidate_all();
        Ok(())
    }

    async fn delete_folder(&self, account_id: &str, name: &str) -> Result<()> {
        folder::delete_folder(&self.pool, account_id, name).await?;
        self.message_cache.invalidate_all();
        Ok(())
    }

    async fn get_folders(&self, account_id: &str) -> Result<Vec<Folder>> {
        folder::get_folders(&self.pool, account_id).await
    }

    //
    // Sync cursors
    //

    async fn get_sync_status(&self, account_id: &str, folder: &str) -> Result<Option<SyncStatus>> {
        folder::get_sync_status(&self.pool, account_id, folder).await
    }

    async fn update_sync_status(&self, status: &SyncStatus) -> Result<()> {
        folder::update_sync_status(&self.pool, status).await
    }

    async fn get_all_sync_status(&self, account_id: &str) -> Result<Vec<SyncStatus>> {
        folder::get_all_sync_status(&self.pool, account_id).await
    }

    async fn delete_sync_status(&self, account_id: &str, folder: &str) -> Result<()> {
        folder::delete_sync_status(&self.pool, account_id, folder).await
    }
}
