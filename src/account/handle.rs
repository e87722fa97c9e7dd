use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::config::{AccountConfig, SyncConfig};
use crate::constants::{IMAP_CLIENT_PREFIX, SMTP_CLIENT_PREFIX};
use crate::events::EventHandler;
use crate::mail::imap::{Connector, ImapClient, ImapConnector, NewMessageCallback};
use crate::mail::smtp::SmtpClient;
use crate::mail::types::Message;
use crate::sync::{FolderReconciler, IncrementalSyncOptions, SyncOptions, SyncReport, Synchronizer};

/// Outcome of the most recent sync pass
#[derive(Debug, Clone, Default)]
pub struct AccountStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<SyncReport>,
}

/// Per-account clients and services
pub struct AccountHandle {
    /// Account configuration with decrypted secrets
    pub config: AccountConfig,
    imap: Arc<ImapClient>,
    /// Separate connection for the mailbox monitor, which holds its lock during IDLE
    monitor: Arc<ImapClient>,
    smtp: Option<Arc<SmtpClient>>,
    synchronizer: Synchronizer,
    reconciler: FolderReconciler,
    events: EventHandler,
    status: RwLock<AccountStatus>,
}

impl AccountHandle {
    /// Build live IMAP and SMTP clients for an account whose secrets are decrypted.
    pub fn new(config: AccountConfig, events: EventHandler) -> Result<Self> {
        let smtp = SmtpClient::new(&config)?.map(Arc::new);
        let connector: Arc<dyn Connector> = Arc::new(ImapConnector::new(&config));
        Ok(Self::with_connector(config, connector, smtp, events))
    }

    pub fn with_connector(
        config: AccountConfig,
        connector: Arc<dyn Connector>,
        smtp: Option<Arc<SmtpClient>>,
        events: EventHandler,
    ) -> Self {
        let imap = Arc::new(ImapClient::new(&config.id, connector.clone()));
        let monitor = Arc::new(ImapClient::new(&config.id, connector));
        Self {
            synchronizer: Synchronizer::new(imap.clone(), events.clone()),
            reconciler: FolderReconciler::new(imap.clone(), events.clone()),
            config,
            imap,
            monitor,
            smtp,
            events,
            status: RwLock::new(AccountStatus::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn display_name(&self) -> &str {
        self.config.display_name_or_email()
    }

    pub fn imap(&self) -> &Arc<ImapClient> {
        &self.imap
    }

    pub fn monitor_client(&self) -> &Arc<ImapClient> {
        &self.monitor
    }

    pub fn smtp(&self) -> Option<&Arc<SmtpClient>> {
        self.smtp.as_ref()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    pub fn reconciler(&self) -> &FolderReconciler {
        &self.reconciler
    }

    /// Id under which the IMAP client is supervised
    pub fn imap_client_id(&self) -> String {
        format!("{}{}", IMAP_CLIENT_PREFIX, self.config.id)
    }

    pub fn smtp_client_id(&self) -> String {
        format!("{}{}", SMTP_CLIENT_PREFIX, self.config.id)
    }

    pub async fn status(&self) -> AccountStatus {
        self.status.read().await.clone()
    }

    /// Sync options for this account built from the configured defaults
    pub fn sync_options(&self, settings: &SyncConfig) -> SyncOptions {
        let mut options = SyncOptions::new(&self.config.id);
        options.batch_size = settings.batch_size;
        options.max_emails = settings.max_emails;
        options.sync_attachments = settings.sync_attachments;
        options
    }

    /// Run an incremental pass over every folder and record the outcome.
    pub async fn sync_all(&self, settings: &SyncConfig) -> Result<SyncReport> {
        let options = IncrementalSyncOptions {
            sync: self.sync_options(settings),
            check_status_changes: settings.check_status_changes,
        };
        let result = self.synchronizer.sync_incremental(&options).await;

        let mut status = self.status.write().await;
        match &result {
            Ok(report) => {
                status.last_sync = Some(Utc::now());
                status.last_error = None;
                status.last_report = Some(report.clone());
            }
            Err(e) => {
                status.last_error = Some(format!("{:#}", e));
            }
        }
        result
    }

    /// Callback for the mailbox monitor: store and announce each new message.
    pub fn new_message_callback(&self) -> NewMessageCallback {
        let events = self.events.clone();
        Arc::new(move |message: Message| {
            let events = events.clone();
            async move {
                let id = message.id.clone();
                if let Err(e) = events.handle_new_message(message).await {
                    tracing::error!("Failed to store new message {}: {:#}", id, e);
                }
            }
            .boxed()
        })
    }
}
