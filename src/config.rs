use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::constants::{
    DEFAULT_BATCH_SIZE, FOLDER_SYNC_INTERVAL_MINS, HEALTH_CHECK_INTERVAL_SECS,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// SQLite database path (default: data dir)
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Master key file for credential encryption (default: config dir)
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default = "default_folder_sync_minutes")]
    pub folder_sync_minutes: u64,
    /// Folder watched for new mail on every account
    #[serde(default = "default_monitor_folder")]
    pub monitor_folder: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            database: None,
            key_file: None,
            health_check_secs: default_health_check_secs(),
            folder_sync_minutes: default_folder_sync_minutes(),
            monitor_folder: default_monitor_folder(),
        }
    }
}

/// Defaults for synchronization runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// 0 = unbounded
    #[serde(default)]
    pub max_emails: usize,
    #[serde(default)]
    pub sync_attachments: bool,
    #[serde(default = "default_true")]
    pub check_status_changes: bool,
    #[serde(default = "default_true")]
    pub create_missing_folders: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_emails: 0,
            sync_attachments: false,
            check_status_changes: true,
            create_missing_folders: true,
        }
    }
}

/// Authentication method for an email account
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Traditional password authentication
    #[default]
    Password,
    /// XOAUTH2 with an already issued access token. Secrets are stored encrypted.
    OAuth2 {
        client_id: String,
        #[serde(default)]
        client_secret: String,
        #[serde(default)]
        access_token: String,
        #[serde(default)]
        refresh_token: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Stable account identifier used in client ids and store keys
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub imap: ImapConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    /// Authentication method (default: password)
    #[serde(default)]
    pub auth: AuthMethod,
}

impl AccountConfig {
    /// Get the display name or fall back to email
    pub fn display_name_or_email(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }

    pub fn imap_username(&self) -> &str {
        self.imap.username.as_deref().unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    /// Encrypted password
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    /// Encrypted password
    #[serde(default)]
    pub password: String,
}

fn default_imap_port() -> u16 {
    993
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_health_check_secs() -> u64 {
    HEALTH_CHECK_INTERVAL_SECS
}

fn default_folder_sync_minutes() -> u64 {
    FOLDER_SYNC_INTERVAL_MINS
}

fn default_monitor_folder() -> String {
    "INBOX".to_string()
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailbridge");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailbridge");
        Ok(dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.bridge.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("mailbridge.db")),
        }
    }

    pub fn key_file_path(&self) -> Result<PathBuf> {
        match &self.bridge.key_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join("master.key")),
        }
    }

    /// Get account by its identifier
    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [[accounts]]\n\
                 id = \"personal\"\n\
                 email = \"you@example.com\"\n\n\
                 [accounts.imap]\n\
                 server = \"imap.example.com\"\n\
                 password = \"<output of 'mailbridge encrypt'>\"\n\n\
                 [accounts.smtp]\n\
                 server = \"smtp.example.com\"",
                path.display()
            );
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;

        for account in &config.accounts {
            if account.id.trim().is_empty() {
                anyhow::bail!("Account {} has an empty id", account.email);
            }
        }
        let mut ids: Vec<&str> = config.accounts.iter().map(|a| a.id.as_str()).collect();
        ids.sort_unstable();
        if let Some(dup) = ids.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("Duplicate account id '{}'", dup[0]);
        }

        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        let db_path = self.database_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }
        Ok(())
    }
}
