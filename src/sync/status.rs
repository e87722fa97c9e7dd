use anyhow::{Context, Result};

use crate::constants::FLAG_SYNC_BATCH_SIZE;
use crate::events::EventHandler;
use crate::mail::imap::ImapClient;
use crate::mail::types::EmailFlags;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatusOutcome {
    pub changed: usize,
    pub removed: usize,
}

/// Compare every stored message of `folder` against the server's flags.
///
/// Read state is updated where it disagrees. A message whose UID is gone from
/// the folder is deleted locally; if it was moved, syncing the destination
/// folder brings it back.
pub(crate) async fn detect_changes(
    client: &ImapClient,
    events: &EventHandler,
    folder: &str,
) -> Result<StatusOutcome> {
    let states = events
        .store()
        .message_states(client.account_id(), folder)
        .await
        .with_context(|| format!("Failed to load stored messages of '{}'", folder))?;

    let mut outcome = StatusOutcome::default();
    for chunk in states.chunks(FLAG_SYNC_BATCH_SIZE) {
        let uids: Vec<u32> = chunk.iter().map(|s| s.uid).collect();
        let flags = client
            .fetch_flags(folder, &uids)
            .await
            .with_context(|| format!("Failed to fetch flags in '{}'", folder))?;

        for state in chunk {
            match flags.get(&state.uid) {
                Some(flags) => {
                    let is_read = flags.contains(EmailFlags::SEEN);
                    if is_read != state.is_read
                        && events.handle_status_change(&state.id, is_read).await?
                    {
                        outcome.changed += 1;
                    }
                }
                None => {
                    events.handle_deleted_message(&state.id).await?;
                    outcome.removed += 1;
                }
            }
        }
    }

    if outcome != StatusOutcome::default() {
        tracing::info!(
            "'{}' for '{}': {} status change(s), {} removed",
            folder,
            client.account_id(),
            outcome.changed,
            outcome.removed
        );
    }
    Ok(outcome)
}
