//! IMAP protocol client and mailbox monitor.
//!
//! This module is split into:
//! - `mod.rs` - Connection traits, error types, transport error detection
//! - `session.rs` - async-imap backed connection over TLS or plain TCP
//! - `client.rs` - `ImapClient`: locked connection with one-shot reconnect-and-retry
//! - `monitor.rs` - New mail monitor (IDLE or polling) and its registry

mod client;
mod monitor;
mod session;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::LazyLock;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use super::types::{FetchedMessage, FolderStatus, RemoteFolder};

pub use client::ImapClient;
pub use monitor::{MonitorRegistry, MonitorState, NewMessageCallback};
pub use session::ImapConnector;

#[derive(Debug, Error)]
pub enum ImapError {
    #[error("not connected to IMAP server")]
    NotConnected,
    #[error("mailbox '{0}' not found")]
    MailboxNotFound(String),
    #[error("folder '{0}' did not report a UID validity")]
    MissingUidValidity(String),
    #[error("maximum retries exceeded")]
    MaxRetriesExceeded,
    #[error("a monitor is already running for '{0}'")]
    AlreadyMonitoring(String),
}

/// XOAUTH2 authenticator for IMAP
pub(crate) struct XOAuth2Authenticator {
    pub user: String,
    pub access_token: String,
}

impl async_imap::Authenticator for XOAuth2Authenticator {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// How an IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed an untagged response
    NewData,
    Timeout,
    /// The stop signal fired while waiting
    Stopped,
}

/// One authenticated protocol session.
///
/// Folder-scoped calls (`uid_search`, `uid_fetch`, `idle`) act on the folder
/// chosen by the last `select`.
#[async_trait]
pub trait MailConnection: Send {
    async fn select(&mut self, folder: &str) -> Result<FolderStatus>;
    /// Raw `UID SEARCH`; results in ascending order
    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>>;
    /// `UID FETCH` of a sequence set. Without `with_body` only UID and flags are fetched.
    async fn uid_fetch(&mut self, uid_set: &str, with_body: bool) -> Result<Vec<FetchedMessage>>;
    async fn list(&mut self) -> Result<Vec<RemoteFolder>>;
    async fn list_subscribed(&mut self) -> Result<Vec<String>>;
    async fn create(&mut self, name: &str) -> Result<()>;
    async fn rename(&mut self, from: &str, to: &str) -> Result<()>;
    async fn delete(&mut self, name: &str) -> Result<()>;
    async fn subscribe(&mut self, name: &str) -> Result<()>;
    async fn unsubscribe(&mut self, name: &str) -> Result<()>;
    async fn noop(&mut self) -> Result<()>;
    fn supports_idle(&self) -> bool;
    /// Block in IDLE until the server pushes, `timeout` elapses or `stop` flips to true.
    async fn idle(
        &mut self,
        timeout: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<IdleOutcome>;
    async fn logout(&mut self) -> Result<()>;
}

/// Opens new authenticated sessions for one account.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MailConnection>>;
    /// Host name used in log lines
    fn server(&self) -> &str;
}

static TRANSPORT_PATTERNS: LazyLock<Option<AhoCorasick>> = LazyLock::new(|| {
    AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build([
            "connection closed",
            "connection reset",
            "connection lost",
            "unexpected eof",
            "end of file",
            "i/o timeout",
            "timed out",
            "broken pipe",
            "use of closed network connection",
        ])
        .ok()
});

/// Whether an error means the connection itself is gone.
///
/// Any I/O error in the chain counts, as does a message matching one of the
/// known transport failure phrases.
pub fn is_transport_error(err: &anyhow::Error) -> bool {
    if err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some()
            || matches!(cause.downcast_ref::<ImapError>(), Some(ImapError::NotConnected))
    }) {
        return true;
    }

    let Some(matcher) = TRANSPORT_PATTERNS.as_ref() else {
        return false;
    };
    err.chain()
        .any(|cause| matcher.is_match(cause.to_string().as_str()))
}

/// Whether a SELECT failure means the mailbox does not exist on the server.
pub fn is_missing_mailbox(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if matches!(cause.downcast_ref::<ImapError>(), Some(ImapError::MailboxNotFound(_))) {
            return true;
        }
        let text = cause.to_string().to_ascii_lowercase();
        text.contains("nonexistent")
            || text.contains("unknown mailbox")
            || text.contains("mailbox does not exist")
            || text.contains("mailbox doesn't exist")
    })
}
