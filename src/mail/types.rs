use std::collections::BTreeMap;

use bitflags::bitflags;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::UID_HEADER;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct EmailFlags: u32 {
        const SEEN = 0b00000001;
        const ANSWERED = 0b00000010;
        const FLAGGED = 0b00000100;
        const DELETED = 0b00001000;
        const DRAFT = 0b00010000;
    }
}

bitflags! {
    /// Special purpose of a folder, inferred from its name or server attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct SpecialUse: u32 {
        const INBOX = 0b0000001;
        const SENT = 0b0000010;
        const TRASH = 0b0000100;
        const DRAFTS = 0b0001000;
        const JUNK = 0b0010000;
        const ARCHIVE = 0b0100000;
        const IMPORTANT = 0b1000000;
    }
}

bitflags! {
    /// Mailbox attributes reported by LIST.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FolderAttributes: u32 {
        const NO_SELECT = 0b000000001;
        const NO_INFERIORS = 0b000000010;
        const MARKED = 0b000000100;
        const HAS_CHILDREN = 0b000001000;
        const SENT = 0b000010000;
        const TRASH = 0b000100000;
        const DRAFTS = 0b001000000;
        const JUNK = 0b010000000;
        const ARCHIVE = 0b100000000;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub name: Option<String>,
    pub email: String,
}

impl Address {
    pub fn new(name: Option<&str>, email: &str) -> Self {
        Self {
            name: name.map(|s| s.to_string()),
            email: email.to_string(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", name, self.email),
            None => f.write_str(&self.email),
        }
    }
}

/// Attachment metadata. Bodies are never transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub email_id: String,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content_id: Option<String>,
}

/// A normalized email as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub account_id: String,
    pub folder: String,
    pub uid: u32,
    pub message_id: String,
    pub from: Address,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    /// Zero (the epoch) when the message carries no usable date
    pub date: DateTime<Utc>,
    pub is_read: bool,
    pub has_attachments: bool,
    pub headers: BTreeMap<String, String>,
    pub text_content: Option<String>,
    pub html_content: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Identifier of a message within an account: unique across folders.
    pub fn make_id(account_id: &str, folder: &str, uid: u32) -> String {
        format!("{}-{}-{}", account_id, folder, uid)
    }

    /// The server UID recorded in the stored headers, falling back to the uid field.
    #[allow(dead_code)]
    pub fn imap_uid(&self) -> u32 {
        self.headers
            .get(UID_HEADER)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(self.uid)
    }
}

/// Folder as seen by the bridge, either from the server or the local store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub account_id: String,
    pub name: String,
    pub delimiter: Option<String>,
    pub special_use: SpecialUse,
    pub selectable: bool,
    pub subscribed: bool,
    pub has_children: bool,
}

impl Folder {
    pub fn new(account_id: &str, name: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            name: name.to_string(),
            delimiter: None,
            special_use: SpecialUse::empty(),
            selectable: true,
            subscribed: false,
            has_children: false,
        }
    }
}

/// Folder entry as returned by LIST, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub name: String,
    pub delimiter: Option<String>,
    pub attributes: FolderAttributes,
    /// Present in LSUB
    pub subscribed: bool,
}

/// Result of SELECT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// A message as returned by one bulk UID FETCH, before parsing.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    pub uid: u32,
    pub flags: EmailFlags,
    pub internal_date: Option<DateTime<Utc>>,
    pub size: Option<u32>,
    pub raw: Vec<u8>,
}

/// Server-side search criteria.
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub since: Option<NaiveDate>,
    pub before: Option<NaiveDate>,
    pub text: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub is_read: Option<bool>,
    /// Inclusive lower bound and optional upper bound (`None` = `*`)
    pub uid_range: Option<(u32, Option<u32>)>,
    pub offset: usize,
    /// Zero means no limit
    pub limit: usize,
}

impl SearchCriteria {
    pub fn uids_from(start: u32) -> Self {
        Self {
            uid_range: Some((start, None)),
            ..Default::default()
        }
    }

    /// Render as the argument of `UID SEARCH`.
    pub fn to_imap_query(&self) -> String {
        let mut parts = Vec::new();

        if let Some((start, end)) = self.uid_range {
            let end = end.map(|e| e.to_string()).unwrap_or_else(|| "*".to_string());
            parts.push(format!("UID {}:{}", start.max(1), end));
        }
        if let Some(since) = self.since {
            parts.push(format!("SINCE {}", imap_date(since)));
        }
        if let Some(before) = self.before {
            parts.push(format!("BEFORE {}", imap_date(before)));
        }
        if let Some(text) = &self.text {
            parts.push(format!("TEXT {}", quote(text)));
        }
        if let Some(subject) = &self.subject {
            parts.push(format!("SUBJECT {}", quote(subject)));
        }
        if let Some(from) = &self.from {
            parts.push(format!("FROM {}", quote(from)));
        }
        if let Some(to) = &self.to {
            parts.push(format!("TO {}", quote(to)));
        }
        match self.is_read {
            Some(true) => parts.push("SEEN".to_string()),
            Some(false) => parts.push("UNSEEN".to_string()),
            None => {}
        }

        if parts.is_empty() {
            "ALL".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// Apply offset/limit to an ascending UID list.
    pub fn page(&self, mut uids: Vec<u32>) -> Vec<u32> {
        uids.sort_unstable();
        let iter = uids.into_iter().skip(self.offset);
        if self.limit > 0 {
            iter.take(self.limit).collect()
        } else {
            iter.collect()
        }
    }
}

fn imap_date(date: NaiveDate) -> String {
    date.format("%-d-%b-%Y").to_string()
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
