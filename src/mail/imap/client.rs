//! Locked IMAP client: connection lifecycle, search, fetch and folder operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, watch};

use super::{Connector, IdleOutcome, ImapError, MailConnection, is_transport_error};
use crate::connection::ManagedConnection;
use crate::mail::parser::parse_message;
use crate::mail::types::{
    EmailFlags, FetchedMessage, FolderStatus, Message, RemoteFolder, SearchCriteria,
};

type Conn = Box<dyn MailConnection>;

/// One account's protocol client.
///
/// All operations hold the connection lock for their whole duration. An
/// operation that hits a transport error reconnects and is retried exactly
/// once; a second failure is returned to the caller.
pub struct ImapClient {
    account_id: String,
    connector: Arc<dyn Connector>,
    conn: Mutex<Option<Conn>>,
    connected: AtomicBool,
    supports_idle: AtomicBool,
}

impl ImapClient {
    pub fn new(account_id: &str, connector: Arc<dyn Connector>) -> Self {
        Self {
            account_id: account_id.to_string(),
            connector,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            supports_idle: AtomicBool::new(false),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    //
    // Connection Management
    //

    async fn open(&self) -> Result<Conn> {
        let conn = self.connector.connect().await.with_context(|| {
            format!(
                "Failed to connect account '{}' to {}",
                self.account_id,
                self.connector.server()
            )
        })?;
        self.supports_idle
            .store(conn.supports_idle(), Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        tracing::info!(
            "Connected account '{}' to IMAP server {}",
            self.account_id,
            self.connector.server()
        );
        Ok(conn)
    }

    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(mut old) = guard.take() {
            old.logout().await.ok();
        }
        *guard = Some(self.open().await?);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.connected.store(false, Ordering::Relaxed);
        if let Some(mut conn) = guard.take() {
            conn.logout().await.ok();
            tracing::info!("Disconnected account '{}'", self.account_id);
        }
        Ok(())
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Capability seen at the last login.
    pub fn supports_idle(&self) -> bool {
        self.supports_idle.load(Ordering::Relaxed)
    }

    /// Run `op` on the live connection, reconnecting and retrying once on a transport error.
    async fn run<T, F>(&self, name: &str, mut op: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnMut(&'c mut Conn) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }

        let first = match guard.as_mut() {
            Some(conn) => op(conn).await,
            None => Err(ImapError::NotConnected.into()),
        };

        let err = match first {
            Ok(value) => return Ok(value),
            Err(e) if is_transport_error(&e) => e,
            Err(e) => return Err(e),
        };

        tracing::warn!(
            "IMAP {} for '{}' hit a transport error, reconnecting: {:#}",
            name,
            self.account_id,
            err
        );
        self.connected.store(false, Ordering::Relaxed);
        *guard = None;
        *guard = Some(self.open().await?);

        let retried = match guard.as_mut() {
            Some(conn) => op(conn).await,
            None => Err(ImapError::NotConnected.into()),
        };
        if let Err(e) = &retried
            && is_transport_error(e)
        {
            self.connected.store(false, Ordering::Relaxed);
            *guard = None;
        }
        retried.with_context(|| format!("IMAP {} failed after reconnect", name))
    }

    //
    // Folder Operations
    //

    pub async fn select(&self, folder: &str) -> Result<FolderStatus> {
        let folder = folder.to_string();
        self.run("SELECT", |conn| {
            let folder = folder.clone();
            Box::pin(async move { conn.select(&folder).await })
        })
        .await
    }

    /// NOOP then re-select `folder` to pick up changes.
    pub async fn poll(&self, folder: &str) -> Result<FolderStatus> {
        let folder = folder.to_string();
        self.run("poll", |conn| {
            let folder = folder.clone();
            Box::pin(async move {
                conn.noop().await?;
                conn.select(&folder).await
            })
        })
        .await
    }

    /// LIST joined with LSUB. A failing LSUB leaves every folder unsubscribed.
    pub async fn list_folders(&self) -> Result<Vec<RemoteFolder>> {
        let account_id = self.account_id.clone();
        self.run("LIST", |conn| {
            let account_id = account_id.clone();
            Box::pin(async move {
                let mut folders = conn.list().await?;
                match conn.list_subscribed().await {
                    Ok(subscribed) => {
                        for folder in &mut folders {
                            folder.subscribed = subscribed.contains(&folder.name);
                        }
                    }
                    Err(e) if is_transport_error(&e) => return Err(e),
                    Err(e) => tracing::warn!("LSUB failed for '{}': {}", account_id, e),
                }
                Ok(folders)
            })
        })
        .await
    }

    pub async fn create_folder(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run("CREATE", |conn| {
            let name = name.clone();
            Box::pin(async move { conn.create(&name).await })
        })
        .await
    }

    pub async fn rename_folder(&self, from: &str, to: &str) -> Result<()> {
        let (from, to) = (from.to_string(), to.to_string());
        self.run("RENAME", |conn| {
            let (from, to) = (from.clone(), to.clone());
            Box::pin(async move { conn.rename(&from, &to).await })
        })
        .await
    }

    pub async fn delete_folder(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run("DELETE", |conn| {
            let name = name.clone();
            Box::pin(async move { conn.delete(&name).await })
        })
        .await
    }

    pub async fn subscribe(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run("SUBSCRIBE", |conn| {
            let name = name.clone();
            Box::pin(async move { conn.subscribe(&name).await })
        })
        .await
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.run("UNSUBSCRIBE", |conn| {
            let name = name.clone();
            Box::pin(async move { conn.unsubscribe(&name).await })
        })
        .await
    }

    //
    // Search and Fetch
    //

    /// Matching UIDs in ascending order, with `offset`/`limit` applied.
    ///
    /// A `UID n:*` search always returns the highest UID even when it is
    /// below `n`; such UIDs are dropped here.
    pub async fn search_uids(&self, folder: &str, criteria: &SearchCriteria) -> Result<Vec<u32>> {
        let folder = folder.to_string();
        let query = criteria.to_imap_query();
        let uids = self
            .run("UID SEARCH", |conn| {
                let (folder, query) = (folder.clone(), query.clone());
                Box::pin(async move {
                    conn.select(&folder).await?;
                    conn.uid_search(&query).await
                })
            })
            .await?;

        let uids = match criteria.uid_range {
            Some((start, end)) => uids
                .into_iter()
                .filter(|&uid| uid >= start && end.is_none_or(|end| uid <= end))
                .collect(),
            None => uids,
        };
        Ok(criteria.page(uids))
    }

    /// Highest UID currently in `folder`, if any.
    pub async fn highest_uid(&self, folder: &str) -> Result<Option<u32>> {
        let uids = self.search_uids(folder, &SearchCriteria::default()).await?;
        Ok(uids.last().copied())
    }

    /// One bulk fetch of full messages.
    pub async fn fetch_raw(&self, folder: &str, uids: &[u32]) -> Result<Vec<FetchedMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let folder = folder.to_string();
        let uid_set = uid_set(uids);
        self.run("UID FETCH", |conn| {
            let (folder, uid_set) = (folder.clone(), uid_set.clone());
            Box::pin(async move {
                conn.select(&folder).await?;
                conn.uid_fetch(&uid_set, true)
                    .await
                    .with_context(|| format!("Failed to fetch {} from '{}'", uid_set, folder))
            })
        })
        .await
    }

    /// Flags of the given UIDs. UIDs missing from the result are gone from the folder.
    pub async fn fetch_flags(&self, folder: &str, uids: &[u32]) -> Result<HashMap<u32, EmailFlags>> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        let folder = folder.to_string();
        let uid_set = uid_set(uids);
        let fetched = self
            .run("UID FETCH FLAGS", |conn| {
                let (folder, uid_set) = (folder.clone(), uid_set.clone());
                Box::pin(async move {
                    conn.select(&folder).await?;
                    conn.uid_fetch(&uid_set, false).await
                })
            })
            .await?;
        Ok(fetched.into_iter().map(|m| (m.uid, m.flags)).collect())
    }

    /// Fetch and parse messages. Unparseable messages are logged and skipped.
    pub async fn fetch_messages(&self, folder: &str, uids: &[u32]) -> Result<Vec<Message>> {
        let fetched = self.fetch_raw(folder, uids).await?;
        let mut messages = Vec::with_capacity(fetched.len());
        for raw in &fetched {
            match parse_message(&self.account_id, folder, raw) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(
                    "Skipping message UID {} in '{}' for '{}': {:#}",
                    raw.uid,
                    folder,
                    self.account_id,
                    e
                ),
            }
        }
        Ok(messages)
    }

    /// Search `folder`, then fetch and parse every match.
    pub async fn search_and_fetch(
        &self,
        folder: &str,
        criteria: &SearchCriteria,
    ) -> Result<Vec<Message>> {
        let uids = self.search_uids(folder, criteria).await?;
        self.fetch_messages(folder, &uids).await
    }

    //
    // Push
    //

    /// Select `folder` and wait in IDLE. Holds the connection lock while waiting.
    pub async fn idle(
        &self,
        folder: &str,
        timeout: Duration,
        stop: &watch::Receiver<bool>,
    ) -> Result<IdleOutcome> {
        let folder = folder.to_string();
        let stop = stop.clone();
        self.run("IDLE", |conn| {
            let folder = folder.clone();
            let mut stop = stop.clone();
            Box::pin(async move {
                conn.select(&folder).await?;
                conn.idle(timeout, &mut stop).await
            })
        })
        .await
    }
}

#[async_trait]
impl ManagedConnection for ImapClient {
    fn is_connected(&self) -> bool {
        ImapClient::is_connected(self)
    }

    async fn reconnect(&self) -> Result<()> {
        ImapClient::reconnect(self).await
    }

    async fn disconnect(&self) -> Result<()> {
        ImapClient::disconnect(self).await
    }
}

/// Compact a UID list into an IMAP sequence set (`1:3,7,9:10`).
pub(crate) fn uid_set(uids: &[u32]) -> String {
    let mut sorted = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if uid == end + 1 {
            end = uid;
            continue;
        }
        parts.push(range(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range(start, end));
    parts.join(",")
}

fn range(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}:{}", start, end)
    }
}
