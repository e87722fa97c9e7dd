//! Typed mail events and the publish/subscribe hub.
//!
//! - `mod.rs` - `MailEvent`, `EventKind` and the `Dispatcher`
//! - `handler.rs` - `EventHandler`: store mutation followed by exactly one event

mod handler;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::mail::types::{Folder, Message};

pub use handler::EventHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    New,
    Read,
    Unread,
    Moved,
    Deleted,
    FolderCreated,
    FolderRenamed,
    FolderDeleted,
    FolderSynced,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::New,
        EventKind::Read,
        EventKind::Unread,
        EventKind::Moved,
        EventKind::Deleted,
        EventKind::FolderCreated,
        EventKind::FolderRenamed,
        EventKind::FolderDeleted,
        EventKind::FolderSynced,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventKind::New => "new",
            EventKind::Read => "read",
            EventKind::Unread => "unread",
            EventKind::Moved => "moved",
            EventKind::Deleted => "deleted",
            EventKind::FolderCreated => "folder_created",
            EventKind::FolderRenamed => "folder_renamed",
            EventKind::FolderDeleted => "folder_deleted",
            EventKind::FolderSynced => "folder_synced",
        };
        f.write_str(name)
    }
}

/// Something that changed local state. Published once, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum MailEvent {
    New(Message),
    Read(Message),
    Unread(Message),
    Moved {
        message: Message,
        from: String,
        to: String,
    },
    /// Carries the message as it was before deletion
    Deleted(Message),
    FolderCreated {
        account_id: String,
        folder: String,
    },
    FolderRenamed {
        account_id: String,
        from: String,
        to: String,
    },
    FolderDeleted {
        account_id: String,
        folder: String,
    },
    FolderSynced {
        account_id: String,
        folders: Vec<Folder>,
    },
}

impl MailEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MailEvent::New(_) => EventKind::New,
            MailEvent::Read(_) => EventKind::Read,
            MailEvent::Unread(_) => EventKind::Unread,
            MailEvent::Moved { .. } => EventKind::Moved,
            MailEvent::Deleted(_) => EventKind::Deleted,
            MailEvent::FolderCreated { .. } => EventKind::FolderCreated,
            MailEvent::FolderRenamed { .. } => EventKind::FolderRenamed,
            MailEvent::FolderDeleted { .. } => EventKind::FolderDeleted,
            MailEvent::FolderSynced { .. } => EventKind::FolderSynced,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            MailEvent::New(m) | MailEvent::Read(m) | MailEvent::Unread(m) | MailEvent::Deleted(m) => {
                &m.account_id
            }
            MailEvent::Moved { message, .. } => &message.account_id,
            MailEvent::FolderCreated { account_id, .. }
            | MailEvent::FolderRenamed { account_id, .. }
            | MailEvent::FolderDeleted { account_id, .. }
            | MailEvent::FolderSynced { account_id, .. } => account_id,
        }
    }
}

/// Subscriber callback. Each delivery runs in its own task.
pub type Subscriber = Arc<dyn Fn(MailEvent) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct Dispatcher {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, kind: EventKind, subscriber: Subscriber) -> SubscriptionId {
        self.subscribe_many(&[kind], subscriber).await
    }

    /// One subscription covering every event kind.
    pub async fn subscribe_all(&self, subscriber: Subscriber) -> SubscriptionId {
        self.subscribe_many(&EventKind::ALL, subscriber).await
    }

    async fn subscribe_many(&self, kinds: &[EventKind], subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.write().await;
        for kind in kinds {
            subscribers
                .entry(*kind)
                .or_default()
                .push((id, subscriber.clone()));
        }
        id
    }

    /// Returns false if the subscription was unknown.
    #[allow(dead_code)]
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        let mut subscribers = self.subscribers.write().await;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Notify every subscriber of the event's kind without waiting for them.
    /// Returns how many subscribers were notified.
    pub async fn publish(&self, event: MailEvent) -> usize {
        let kind = event.kind();
        let targets: Vec<Subscriber> = match self.subscribers.read().await.get(&kind) {
            Some(list) => list.iter().map(|(_, s)| s.clone()).collect(),
            None => Vec::new(),
        };

        tracing::debug!(
            "Publishing {} event for '{}' to {} subscriber(s)",
            kind,
            event.account_id(),
            targets.len()
        );
        for subscriber in &targets {
            tokio::spawn(subscriber(event.clone()));
        }
        targets.len()
    }
}

/// Subscriber that writes one log line per event.
pub fn log_subscriber() -> Subscriber {
    Arc::new(|event: MailEvent| {
        Box::pin(async move {
            let detail = match &event {
                MailEvent::New(m)
                | MailEvent::Read(m)
                | MailEvent::Unread(m)
                | MailEvent::Deleted(m) => format!("{} '{}'", m.id, m.subject),
                MailEvent::Moved { message, from, to } => {
                    format!("{} '{}' -> '{}'", message.id, from, to)
                }
                MailEvent::FolderCreated { folder, .. } | MailEvent::FolderDeleted { folder, .. } => {
                    format!("'{}'", folder)
                }
                MailEvent::FolderRenamed { from, to, .. } => format!("'{}' -> '{}'", from, to),
                MailEvent::FolderSynced { folders, .. } => format!("{} folder(s)", folders.len()),
            };
            tracing::info!("[{}] {}: {}", event.account_id(), event.kind(), detail);
        })
    })
}

/// Subscriber that forwards every event into a channel.
#[cfg(test)]
pub(crate) fn channel_subscriber() -> (Subscriber, tokio::sync::mpsc::UnboundedReceiver<MailEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let subscriber: Subscriber = Arc::new(move |event| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(event).ok();
        })
    });
    (subscriber, rx)
}

/// Drain whatever has been delivered so far, giving spawned deliveries a moment to land.
#[cfg(test)]
pub(crate) async fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<MailEvent>) -> Vec<MailEvent> {
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn folder_created(folder: &str) -> MailEvent {
        MailEvent::FolderCreated {
            account_id: "acct".to_string(),
            folder: folder.to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_kind() {
        let dispatcher = Dispatcher::new();
        let (created, mut created_rx) = channel_subscriber();
        let (deleted, mut deleted_rx) = channel_subscriber();
        dispatcher.subscribe(EventKind::FolderCreated, created).await;
        dispatcher.subscribe(EventKind::FolderDeleted, deleted).await;

        assert_eq!(dispatcher.publish(folder_created("Work")).await, 1);

        let events = drain(&mut created_rx).await;
        assert_eq!(events, vec![folder_created("Work")]);
        assert!(drain(&mut deleted_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .subscribe(
                EventKind::FolderCreated,
                Arc::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                    })
                }),
            )
            .await;
        let (fast, mut fast_rx) = channel_subscriber();
        dispatcher.subscribe(EventKind::FolderCreated, fast).await;

        let notified = tokio::time::timeout(
            Duration::from_millis(500),
            dispatcher.publish(folder_created("Work")),
        )
        .await
        .unwrap();
        assert_eq!(notified, 2);
        assert_eq!(drain(&mut fast_rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_all_and_unsubscribe() {
        let dispatcher = Dispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = dispatcher
            .subscribe_all(Arc::new(move |_| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        dispatcher.publish(folder_created("A")).await;
        dispatcher
            .publish(MailEvent::FolderDeleted {
                account_id: "acct".to_string(),
                folder: "A".to_string(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(dispatcher.unsubscribe(id).await);
        assert!(!dispatcher.unsubscribe(id).await);
        assert_eq!(dispatcher.publish(folder_created("B")).await, 0);
    }
}
