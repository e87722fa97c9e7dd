use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

use super::{Dispatcher, MailEvent};
use crate::mail::types::{Folder, Message};
use crate::store::{MailStore, StoreQuery};

/// Applies a change to the store, then publishes the matching event.
///
/// Every state change made by sync, the monitor or folder operations goes
/// through here so subscribers see exactly one event per change.
#[derive(Clone)]
pub struct EventHandler {
    store: Arc<dyn MailStore>,
    dispatcher: Arc<Dispatcher>,
}

impl EventHandler {
    pub fn new(store: Arc<dyn MailStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    async fn load(&self, id: &str) -> Result<Message> {
        self.store
            .get_message(id)
            .await?
            .ok_or_else(|| anyhow!("message '{}' not found", id))
    }

    pub async fn handle_new_message(&self, message: Message) -> Result<()> {
        self.store
            .store_message(&message)
            .await
            .with_context(|| format!("Failed to store message {}", message.id))?;
        self.dispatcher.publish(MailEvent::New(message)).await;
        Ok(())
    }

    /// Returns false, publishing nothing, when the stored flag already matches.
    pub async fn handle_status_change(&self, id: &str, is_read: bool) -> Result<bool> {
        let mut message = self.load(id).await?;
        if message.is_read == is_read {
            return Ok(false);
        }

        self.store
            .update_status(id, is_read)
            .await
            .with_context(|| format!("Failed to update status of {}", id))?;
        message.is_read = is_read;

        let event = if is_read {
            MailEvent::Read(message)
        } else {
            MailEvent::Unread(message)
        };
        self.dispatcher.publish(event).await;
        Ok(true)
    }

    /// Move a stored message to another folder.
    #[allow(dead_code)]
    pub async fn handle_folder_change(&self, id: &str, new_folder: &str) -> Result<()> {
        let mut message = self.load(id).await?;
        let from = std::mem::replace(&mut message.folder, new_folder.to_string());

        self.store
            .move_message(id, new_folder)
            .await
            .with_context(|| format!("Failed to move {} to {}", id, new_folder))?;

        self.dispatcher
            .publish(MailEvent::Moved {
                message,
                from,
                to: new_folder.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn handle_deleted_message(&self, id: &str) -> Result<()> {
        let message = self.load(id).await?;
        self.store
            .delete_message(id)
            .await
            .with_context(|| format!("Failed to delete {}", id))?;
        self.dispatcher.publish(MailEvent::Deleted(message)).await;
        Ok(())
    }

    /// Drop every stored message of a folder, publishing a deletion for each.
    pub async fn handle_folder_purged(&self, account_id: &str, folder: &str) -> Result<usize> {
        let messages = self
            .store
            .search_messages(&StoreQuery {
                account_id: account_id.to_string(),
                folder: Some(folder.to_string()),
                ..Default::default()
            })
            .await?;
        let purged = self
            .store
            .purge_folder(account_id, folder)
            .await
            .with_context(|| format!("Failed to purge folder {}", folder))?;
        for message in messages {
            self.dispatcher.publish(MailEvent::Deleted(message)).await;
        }
        Ok(purged)
    }

    pub async fn handle_folder_created(&self, folder: &Folder) -> Result<()> {
        self.store
            .create_folder(folder)
            .await
            .with_context(|| format!("Failed to create folder {}", folder.name))?;
        self.dispatcher
            .publish(MailEvent::FolderCreated {
                account_id: folder.account_id.clone(),
                folder: folder.name.clone(),
            })
            .await;
        Ok(())
    }

    pub async fn handle_folder_renamed(
        &self,
        account_id: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        self.store
            .rename_folder(account_id, old_name, new_name)
            .await
            .with_context(|| format!("Failed to rename folder {} to {}", old_name, new_name))?;
        self.dispatcher
            .publish(MailEvent::FolderRenamed {
                account_id: account_id.to_string(),
                from: old_name.to_string(),
                to: new_name.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn handle_folder_deleted(&self, account_id: &str, name: &str) -> Result<()> {
        self.store
            .delete_folder(account_id, name)
            .await
            .with_context(|| format!("Failed to delete folder {}", name))?;
        self.dispatcher
            .publish(MailEvent::FolderDeleted {
                account_id: account_id.to_string(),
                folder: name.to_string(),
            })
            .await;
        Ok(())
    }

    pub async fn publish_folders_synced(&self, account_id: &str, folders: Vec<Folder>) {
        self.dispatcher
            .publish(MailEvent::FolderSynced {
                account_id: account_id.to_string(),
                folders,
            })
            .await;
    }
}
