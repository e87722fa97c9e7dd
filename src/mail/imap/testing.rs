//! In-memory IMAP server used by tests across the crate.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use super::{Connector, IdleOutcome, ImapClient, MailConnection};
use crate::mail::types::{EmailFlags, FetchedMessage, FolderAttributes, FolderStatus, RemoteFolder};

#[derive(Debug, Default)]
struct FakeMailbox {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, (EmailFlags, Vec<u8>)>,
    attributes: FolderAttributes,
}

#[derive(Debug, Default)]
struct FakeState {
    folders: BTreeMap<String, FakeMailbox>,
    subscribed: BTreeSet<String>,
    /// Transport failures returned by the next operations, one per call
    failures: VecDeque<String>,
    connect_failures: usize,
    connects: usize,
    body_fetches: usize,
    idle_unsupported: bool,
}

/// Shared handle to the fake server. Cloning shares the mailbox state.
#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<FakeState>>,
    notify: Arc<Notify>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn client(&self, account_id: &str) -> ImapClient {
        ImapClient::new(account_id, self.connector())
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn add_folder(&self, name: &str, uid_validity: u32) {
        self.state().folders.insert(
            name.to_string(),
            FakeMailbox {
                uid_validity,
                next_uid: 1,
                ..Default::default()
            },
        );
    }

    pub fn set_attributes(&self, name: &str, attributes: FolderAttributes) {
        if let Some(mailbox) = self.state().folders.get_mut(name) {
            mailbox.attributes = attributes;
        }
    }

    pub fn subscribe_folder(&self, name: &str) {
        self.state().subscribed.insert(name.to_string());
    }

    pub fn has_folder(&self, name: &str) -> bool {
        self.state().folders.contains_key(name)
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.state().subscribed.contains(name)
    }

    /// Append a message and wake any IDLE waiter. Returns the new UID.
    pub fn append(&self, folder: &str, flags: EmailFlags, raw: Vec<u8>) -> u32 {
        let uid = {
            let mut state = self.state();
            let mailbox = state.folders.entry(folder.to_string()).or_insert_with(|| FakeMailbox {
                uid_validity: 1,
                next_uid: 1,
                ..Default::default()
            });
            let uid = mailbox.next_uid;
            mailbox.next_uid += 1;
            mailbox.messages.insert(uid, (flags, raw));
            uid
        };
        self.notify.notify_one();
        uid
    }

    pub fn set_flags(&self, folder: &str, uid: u32, flags: EmailFlags) {
        if let Some((f, _)) = self
            .state()
            .folders
            .get_mut(folder)
            .and_then(|m| m.messages.get_mut(&uid))
        {
            *f = flags;
        }
    }

    pub fn expunge(&self, folder: &str, uid: u32) {
        if let Some(mailbox) = self.state().folders.get_mut(folder) {
            mailbox.messages.remove(&uid);
        }
    }

    /// Renumber a folder: new UID validity, messages keep their contents under fresh UIDs.
    pub fn renumber(&self, folder: &str, uid_validity: u32) {
        if let Some(mailbox) = self.state().folders.get_mut(folder) {
            let old = std::mem::take(&mut mailbox.messages);
            mailbox.uid_validity = uid_validity;
            mailbox.next_uid = 1;
            for (_, message) in old {
                mailbox.messages.insert(mailbox.next_uid, message);
                mailbox.next_uid += 1;
            }
        }
    }

    pub fn fail_next(&self, message: &str) {
        self.state().failures.push_back(message.to_string());
    }

    pub fn fail_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn disable_idle(&self) {
        self.state().idle_unsupported = true;
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    /// Number of full-body UID FETCH commands served.
    pub fn body_fetches(&self) -> usize {
        self.state().body_fetches
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self) -> Result<Box<dyn MailConnection>> {
        let mut state = self.state();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            bail!("connection refused");
        }
        state.connects += 1;
        Ok(Box::new(FakeConnection {
            server: self.clone(),
            selected: None,
            supports_idle: !state.idle_unsupported,
        }))
    }

    fn server(&self) -> &str {
        "fake.imap"
    }
}

struct FakeConnection {
    server: FakeServer,
    selected: Option<String>,
    supports_idle: bool,
}

impl FakeConnection {
    fn state(&self) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.server.state();
        if let Some(failure) = state.failures.pop_front() {
            return Err(anyhow!(failure));
        }
        Ok(state)
    }

    fn selected(&self) -> Result<String> {
        self.selected
            .clone()
            .ok_or_else(|| anyhow!("BAD no mailbox selected"))
    }
}

/// Parse `1:3,7,9:*` against the UIDs present.
fn matches_set(uid_set: &str, uid: u32, max: u32) -> bool {
    uid_set.split(',').any(|part| match part.split_once(':') {
        Some((a, b)) => {
            let start: u32 = a.parse().unwrap_or(0);
            let end: u32 = if b == "*" { max } else { b.parse().unwrap_or(0) };
            let (lo, hi) = (start.min(end), start.max(end));
            uid >= lo && uid <= hi
        }
        None => part.parse::<u32>().ok() == Some(uid),
    })
}

#[async_trait]
impl MailConnection for FakeConnection {
    async fn select(&mut self, folder: &str) -> Result<FolderStatus> {
        let status = {
            let state = self.state()?;
            let Some(mailbox) = state.folders.get(folder) else {
                bail!("NO [NONEXISTENT] Unknown mailbox {}", folder);
            };
            FolderStatus {
                exists: mailbox.messages.len() as u32,
                uid_validity: Some(mailbox.uid_validity),
                uid_next: Some(mailbox.next_uid),
            }
        };
        self.selected = Some(folder.to_string());
        Ok(status)
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let folder = self.selected()?;
        let state = self.state()?;
        let mailbox = state
            .folders
            .get(&folder)
            .ok_or_else(|| anyhow!("NO mailbox {} vanished", folder))?;

        let max = mailbox.messages.keys().next_back().copied().unwrap_or(0);
        let range = query
            .strip_prefix("UID ")
            .and_then(|rest| rest.split_whitespace().next());
        let wants_seen = if query.contains("UNSEEN") {
            Some(false)
        } else if query.contains("SEEN") {
            Some(true)
        } else {
            None
        };

        let mut uids: Vec<u32> = mailbox
            .messages
            .iter()
            .filter(|(uid, _)| range.is_none_or(|r| matches_set(r, **uid, max)))
            .filter(|(_, (flags, _))| {
                wants_seen.is_none_or(|seen| flags.contains(EmailFlags::SEEN) == seen)
            })
            .map(|(uid, _)| *uid)
            .collect();

        // Like real servers, "n:*" always includes the highest UID
        if let Some(r) = range
            && r.ends_with(":*")
            && uids.is_empty()
            && max > 0
        {
            uids.push(max);
        }
        Ok(uids)
    }

    async fn uid_fetch(&mut self, uid_set: &str, with_body: bool) -> Result<Vec<FetchedMessage>> {
        let folder = self.selected()?;
        let mut state = self.state()?;
        if with_body {
            state.body_fetches += 1;
        }
        let mailbox = state
            .folders
            .get(&folder)
            .ok_or_else(|| anyhow!("NO mailbox {} vanished", folder))?;

        let max = mailbox.messages.keys().next_back().copied().unwrap_or(0);
        Ok(mailbox
            .messages
            .iter()
            .filter(|(uid, _)| matches_set(uid_set, **uid, max))
            .map(|(uid, (flags, raw))| FetchedMessage {
                uid: *uid,
                flags: *flags,
                internal_date: None,
                size: Some(raw.len() as u32),
                raw: if with_body { raw.clone() } else { Vec::new() },
            })
            .collect())
    }

    async fn list(&mut self) -> Result<Vec<RemoteFolder>> {
        let state = self.state()?;
        Ok(state
            .folders
            .iter()
            .map(|(name, mailbox)| RemoteFolder {
                name: name.clone(),
                delimiter: Some("/".to_string()),
                attributes: mailbox.attributes,
                subscribed: false,
            })
            .collect())
    }

    async fn list_subscribed(&mut self) -> Result<Vec<String>> {
        let state = self.state()?;
        Ok(state.subscribed.iter().cloned().collect())
    }

    async fn create(&mut self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.folders.contains_key(name) {
            bail!("NO [ALREADYEXISTS] Mailbox {} exists", name);
        }
        state.folders.insert(
            name.to_string(),
            FakeMailbox {
                uid_validity: 1,
                next_uid: 1,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state()?;
        let mailbox = state
            .folders
            .remove(from)
            .ok_or_else(|| anyhow!("NO [NONEXISTENT] Unknown mailbox {}", from))?;
        state.folders.insert(to.to_string(), mailbox);
        if state.subscribed.remove(from) {
            state.subscribed.insert(to.to_string());
        }
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        state
            .folders
            .remove(name)
            .ok_or_else(|| anyhow!("NO [NONEXISTENT] Unknown mailbox {}", name))?;
        state.subscribed.remove(name);
        Ok(())
    }

    async fn subscribe(&mut self, name: &str) -> Result<()> {
        self.state()?.subscribed.insert(name.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, name: &str) -> Result<()> {
        self.state()?.subscribed.remove(name);
        Ok(())
    }

    async fn noop(&mut self) -> Result<()> {
        self.state()?;
        Ok(())
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<IdleOutcome> {
        if !self.supports_idle {
            bail!("BAD IDLE not supported");
        }
        self.state()?;
        if *stop.borrow() {
            return Ok(IdleOutcome::Stopped);
        }

        let notify = self.server.notify.clone();
        tokio::select! {
            _ = notify.notified() => Ok(IdleOutcome::NewData),
            _ = tokio::time::sleep(timeout) => Ok(IdleOutcome::Timeout),
            _ = stop.changed() => Ok(IdleOutcome::Stopped),
        }
    }

    async fn logout(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }
}

/// Minimal RFC 5322 message whose subject and Message-ID derive from `tag`.
pub(crate) fn simple_message(tag: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: Bob <bob@example.com>\r\n\
         Subject: {tag}\r\n\
         Message-ID: <{tag}@example.com>\r\n\
         Date: Tue, 5 Mar 2024 12:00:00 +0000\r\n\
         \r\n\
         Body of {tag}\r\n"
    )
    .into_bytes()
}

/// Helper for tests that need several messages at once.
pub(crate) fn fill(server: &FakeServer, folder: &str, count: usize) -> Vec<u32> {
    (0..count)
        .map(|i| server.append(folder, EmailFlags::empty(), simple_message(&format!("{}-{}", folder, i))))
        .collect()
}

/// Count of messages per folder on the server, for assertions.
pub(crate) fn message_counts(server: &FakeServer) -> HashMap<String, usize> {
    server
        .state()
        .folders
        .iter()
        .map(|(name, mailbox)| (name.clone(), mailbox.messages.len()))
        .collect()
}
