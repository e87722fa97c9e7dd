use chrono::{DateTime, Utc};

/// Per (account, folder) cursor driving incremental sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub account_id: String,
    pub folder: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub uid_validity: Option<u32>,
    /// Highest UID already ingested
    pub last_uid: u32,
}

impl SyncStatus {
    pub fn new(account_id: &str, folder: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            folder: folder.to_string(),
            last_sync: None,
            uid_validity: None,
            last_uid: 0,
        }
    }

    /// True when no cursor was established under this UID validity.
    pub fn needs_full_sync(&self, server_uid_validity: u32) -> bool {
        self.uid_validity != Some(server_uid_validity)
    }

    /// A full sync ran to the end. Unset while one is still in progress.
    pub fn is_complete(&self) -> bool {
        self.last_sync.is_some()
    }

    /// First UID an incremental sync should ask for.
    pub fn next_uid(&self) -> u32 {
        self.last_uid.saturating_add(1)
    }

    /// Advance the cursor; never moves backwards.
    pub fn advance(&mut self, uid: u32) {
        self.last_uid = self.last_uid.max(uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_full_sync() {
        let mut status = SyncStatus::new("acct", "INBOX");
        assert!(status.needs_full_sync(5));

        // Interrupted full sync: same validity resumes instead of starting over
        status.uid_validity = Some(5);
        status.last_uid = 100;
        assert!(!status.needs_full_sync(5));
        assert!(!status.is_complete());

        status.last_sync = Some(Utc::now());
        assert!(status.is_complete());
        assert!(!status.needs_full_sync(5));
        assert!(status.needs_full_sync(6));
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut status = SyncStatus::new("acct", "INBOX");
        status.advance(10);
        status.advance(4);
        assert_eq!(status.last_uid, 10);
        assert_eq!(status.next_uid(), 11);
    }
}
