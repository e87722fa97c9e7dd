//! Credential encryption at rest.
//!
//! Secrets in the configuration (IMAP/SMTP passwords, OAuth client secret and
//! tokens) are stored as `base64(nonce || ciphertext)` produced by AES-256-GCM.
//! The 32-byte master key is looked up in this order:
//! 1. `MAILBRIDGE_KEY` environment variable (base64)
//! 2. OS keyring entry
//! 3. key file (created with mode 0600 when missing)

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::config::{AccountConfig, AuthMethod};

const ENV_KEY: &str = "MAILBRIDGE_KEY";
const KEYRING_SERVICE: &str = "mailbridge";
const KEYRING_USER: &str = "master-key";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid master key: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("ciphertext is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),
    #[error("ciphertext too short ({0} bytes)")]
    Truncated(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or tampered data)")]
    Decrypt,
    #[error("decrypted secret is not valid UTF-8")]
    NotUtf8,
    #[error("random number generator unavailable: {0}")]
    Rng(String),
}

/// Encrypt/decrypt contract used before persisting and after loading secrets.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn from_key(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Load the master key from env, keyring or `key_file`, creating the file if needed.
    pub fn load_or_create(key_file: &Path) -> Result<Self> {
        let key = KeyStore::new(key_file).load_or_create()?;
        Ok(Self::from_key(&key)?)
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::fill(&mut nonce_bytes).map_err(|e| CryptoError::Rng(e.to_string()))?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let sealed = BASE64.decode(ciphertext.trim())?;
        if sealed.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::NotUtf8)
    }
}

/// Encrypt every secret of an account in place.
#[allow(dead_code)]
pub fn seal_account(account: &mut AccountConfig, cipher: &dyn CredentialCipher) -> Result<()> {
    transform_secrets(account, |s| cipher.encrypt(s))
        .with_context(|| format!("Failed to encrypt credentials for account '{}'", account.id))
}

/// Decrypt every secret of an account in place.
pub fn open_account(account: &mut AccountConfig, cipher: &dyn CredentialCipher) -> Result<()> {
    transform_secrets(account, |s| cipher.decrypt(s))
        .with_context(|| format!("Failed to decrypt credentials for account '{}'", account.id))
}

fn transform_secrets<F>(account: &mut AccountConfig, f: F) -> Result<(), CryptoError>
where
    F: Fn(&str) -> Result<String, CryptoError>,
{
    account.imap.password = f(&account.imap.password)?;
    if let Some(smtp) = account.smtp.as_mut() {
        smtp.password = f(&smtp.password)?;
    }
    if let AuthMethod::OAuth2 {
        client_secret,
        access_token,
        refresh_token,
        ..
    } = &mut account.auth
    {
        *client_secret = f(client_secret)?;
        *access_token = f(access_token)?;
        *refresh_token = f(refresh_token)?;
    }
    Ok(())
}

/// Master key lookup: env var, keyring, then file fallback.
struct KeyStore {
    key_file: PathBuf,
}

impl KeyStore {
    fn new(key_file: &Path) -> Self {
        Self {
            key_file: key_file.to_path_buf(),
        }
    }

    fn load_or_create(&self) -> Result<Vec<u8>> {
        // 1. Try environment variable
        if let Ok(encoded) = env::var(ENV_KEY) {
            let key = BASE64
                .decode(encoded.trim())
                .with_context(|| format!("{} is not valid base64", ENV_KEY))?;
            return check_len(key);
        }

        // 2. Try keyring
        if let Some(key) = self.keyring_get() {
            return check_len(key);
        }

        // 3. Try file fallback
        if let Some(key) = self.file_get()? {
            return check_len(key);
        }

        let mut key = vec![0u8; KEY_LEN];
        getrandom::fill(&mut key).map_err(|e| CryptoError::Rng(e.to_string()))?;

        if self.keyring_set(&key) {
            tracing::info!("Generated new master key in OS keyring");
        } else {
            self.file_set(&key)?;
            tracing::info!("Generated new master key at {}", self.key_file.display());
        }
        Ok(key)
    }

    fn keyring_get(&self) -> Option<Vec<u8>> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER).ok()?;
        let encoded = entry.get_password().ok()?;
        BASE64.decode(encoded.trim()).ok()
    }

    fn keyring_set(&self, key: &[u8]) -> bool {
        let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, KEYRING_USER) else {
            return false;
        };
        // Verify it actually worked
        entry.set_password(&BASE64.encode(key)).is_ok() && self.keyring_get().is_some()
    }

    fn file_get(&self) -> Result<Option<Vec<u8>>> {
        if !self.key_file.exists() {
            return Ok(None);
        }
        let encoded = fs::read_to_string(&self.key_file)
            .with_context(|| format!("Failed to read key file {}", self.key_file.display()))?;
        let key = BASE64
            .decode(encoded.trim())
            .with_context(|| format!("Key file {} is corrupt", self.key_file.display()))?;
        Ok(Some(key))
    }

    /// Write key file with restricted permissions
    fn file_set(&self, key: &[u8]) -> Result<()> {
        if let Some(parent) = self.key_file.parent() {
            fs::create_dir_all(parent)?;
        }

        // Create file with restricted permissions atomically to avoid TOCTOU
        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.key_file)?;
            file.write_all(BASE64.encode(key).as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.key_file, BASE64.encode(key))?;
        }

        Ok(())
    }
}

fn check_len(key: Vec<u8>) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength(key.len()).into());
    }
    Ok(key)
}
