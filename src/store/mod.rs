//! Local mail store.
//!
//! - `mod.rs` - The `MailStore` contract consumed by sync, monitor and events
//! - `sync.rs` - Per-folder sync cursor
//! - `db/` - SQLite implementation

mod db;
mod sync;

use anyhow::Result;
use async_trait::async_trait;

use crate::mail::types::{Attachment, Folder, Message};

pub use db::SqliteStore;
pub use sync::SyncStatus;

/// Local query over stored messages. Empty fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct StoreQuery {
    pub account_id: String,
    pub folder: Option<String>,
    pub is_read: Option<bool>,
    /// Substring match on subject, sender and text body
    pub text: Option<String>,
    pub offset: usize,
    /// Zero means no limit
    pub limit: usize,
}

/// Lightweight view of a stored message used by status-change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    pub id: String,
    pub uid: u32,
    pub is_read: bool,
}

/// Storage contract. Every method must be safe to call concurrently.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn store_message(&self, message: &Message) -> Result<()>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;
    async fn search_messages(&self, query: &StoreQuery) -> Result<Vec<Message>>;
    async fn message_states(&self, account_id: &str, folder: &str) -> Result<Vec<MessageState>>;
    /// Returns false when no message has this id
    async fn update_status(&self, id: &str, is_read: bool) -> Result<bool>;
    async fn move_message(&self, id: &str, folder: &str) -> Result<bool>;
    async fn delete_message(&self, id: &str) -> Result<bool>;
    /// Remove every message of a folder, keeping the folder itself
    async fn purge_folder(&self, account_id: &str, folder: &str) -> Result<usize>;
    async fn get_attachment(&self, id: &str) -> Result<Option<Attachment>>;

    async fn create_folder(&self, folder: &Folder) -> Result<()>;
    async fn rename_folder(&self, account_id: &str, old_name: &str, new_name: &str) -> Result<()>;
    /// Deletes the folder, its messages and its sync cursor
    async fn delete_folder(&self, account_id: &str, name: &str) -> Result<()>;
    async fn get_folders(&self, account_id: &str) -> Result<Vec<Folder>>;

    async fn get_sync_status(&self, account_id: &str, folder: &str) -> Result<Option<SyncStatus>>;
    /// Persist a cursor. The highest UID never decreases for an unchanged UID validity.
    async fn update_sync_status(&self, status: &SyncStatus) -> Result<()>;
    async fn get_all_sync_status(&self, account_id: &str) -> Result<Vec<SyncStatus>>;
    async fn delete_sync_status(&self, account_id: &str, folder: &str) -> Result<()>;
}
