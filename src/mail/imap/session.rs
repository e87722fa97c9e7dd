//! async-imap backed connection.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_imap::Session;
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{Connector, IdleOutcome, ImapError, MailConnection, XOAuth2Authenticator};
use crate::config::{AccountConfig, AuthMethod, ImapConfig};
use crate::mail::parser::parse_flags_from_imap;
use crate::mail::types::{FetchedMessage, FolderAttributes, FolderStatus, RemoteFolder};

const FETCH_FULL: &str = "(UID FLAGS INTERNALDATE RFC822.SIZE BODY.PEEK[])";
const FETCH_FLAGS: &str = "(UID FLAGS)";

/// Opens authenticated sessions for one account.
pub struct ImapConnector {
    config: ImapConfig,
    username: String,
    password: String,
    auth_method: AuthMethod,
}

impl ImapConnector {
    /// Build from an account whose secrets are already decrypted.
    pub fn new(account: &AccountConfig) -> Self {
        let password = match &account.auth {
            AuthMethod::OAuth2 { access_token, .. } => access_token.clone(),
            AuthMethod::Password => account.imap.password.clone(),
        };
        Self {
            config: account.imap.clone(),
            username: account.imap_username().to_string(),
            password,
            auth_method: account.auth.clone(),
        }
    }

    async fn login<S>(&self, stream: S) -> Result<Box<dyn MailConnection>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static,
    {
        let mut client = async_imap::Client::new(stream);
        // Consume the server greeting
        let _greeting = client.read_response().await;

        let mut session = match &self.auth_method {
            AuthMethod::Password => client
                .login(&self.username, &self.password)
                .await
                .map_err(|e| anyhow!("Login failed: {:?}", e.0))?,
            AuthMethod::OAuth2 { .. } => {
                let authenticator = XOAuth2Authenticator {
                    user: self.username.clone(),
                    access_token: self.password.clone(),
                };
                client
                    .authenticate("XOAUTH2", authenticator)
                    .await
                    .map_err(|e| anyhow!("XOAUTH2 authentication failed: {:?}", e.0))?
            }
        };

        let supports_idle = match session.capabilities().await {
            Ok(caps) => caps.has_str("IDLE"),
            Err(e) => {
                tracing::debug!("CAPABILITY failed on {}: {}", self.config.server, e);
                false
            }
        };
        if supports_idle {
            tracing::debug!("Server {} supports IDLE", self.config.server);
        }

        Ok(Box::new(AsyncImapConnection {
            session: Some(session),
            supports_idle,
        }))
    }
}

#[async_trait]
impl Connector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailConnection>> {
        let addr = format!("{}:{}", self.config.server, self.config.port);

        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;

        if !self.config.tls {
            return self.login(tcp.compat()).await;
        }

        let tls = TlsConnector::from(tls_config()?);
        let server_name = ServerName::try_from(self.config.server.clone())
            .with_context(|| format!("Invalid server name '{}'", self.config.server))?;
        let tls_stream = tls
            .connect(server_name, tcp)
            .await
            .context("TLS handshake failed")?;

        self.login(tls_stream.compat()).await
    }

    fn server(&self) -> &str {
        &self.config.server
    }
}

fn tls_config() -> Result<Arc<rustls::ClientConfig>> {
    let roots = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// A live async-imap session over any byte stream.
struct AsyncImapConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    /// Taken out while IDLE owns the session
    session: Option<Session<S>>,
    supports_idle: bool,
}

impl<S> AsyncImapConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    fn session(&mut self) -> Result<&mut Session<S>> {
        self.session
            .as_mut()
            .ok_or_else(|| ImapError::NotConnected.into())
    }
}

#[async_trait]
impl<S> MailConnection for AsyncImapConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug + 'static,
{
    async fn select(&mut self, folder: &str) -> Result<FolderStatus> {
        let mailbox = self
            .session()?
            .select(folder)
            .await
            .with_context(|| format!("Failed to select folder '{}'", folder))?;
        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        })
    }

    async fn uid_search(&mut self, query: &str) -> Result<Vec<u32>> {
        let uids = self
            .session()?
            .uid_search(query)
            .await
            .with_context(|| format!("UID SEARCH {} failed", query))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn uid_fetch(&mut self, uid_set: &str, with_body: bool) -> Result<Vec<FetchedMessage>> {
        let query = if with_body { FETCH_FULL } else { FETCH_FLAGS };
        let fetches: Vec<Fetch> = self
            .session()?
            .uid_fetch(uid_set, query)
            .await
            .context("Failed to fetch messages")?
            .try_collect()
            .await
            .context("Failed to read fetch response")?;

        Ok(fetches.iter().filter_map(fetched_message).collect())
    }

    async fn list(&mut self) -> Result<Vec<RemoteFolder>> {
        let names: Vec<Name> = self
            .session()?
            .list(Some(""), Some("*"))
            .await
            .context("LIST failed")?
            .try_collect()
            .await?;

        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(str::to_string),
                attributes: folder_attributes(name.attributes()),
                subscribed: false,
            })
            .collect())
    }

    async fn list_subscribed(&mut self) -> Result<Vec<String>> {
        let names: Vec<Name> = self
            .session()?
            .lsub(Some(""), Some("*"))
            .await
            .context("LSUB failed")?
            .try_collect()
            .await?;
        Ok(names.iter().map(|n| n.name().to_string()).collect())
    }

    async fn create(&mut self, name: &str) -> Result<()> {
        self.session()?
            .create(name)
            .await
            .with_context(|| format!("Failed to create folder '{}'", name))
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.session()?
            .rename(from, to)
            .await
            .with_context(|| format!("Failed to rename folder '{}' to '{}'", from, to))
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        self.session()?
            .delete(name)
            .await
            .with_context(|| format!("Failed to delete folder '{}'", name))
    }

    async fn subscribe(&mut self, name: &str) -> Result<()> {
        self.session()?
            .subscribe(name)
            .await
            .with_context(|| format!("Failed to subscribe to '{}'", name))
    }

    async fn unsubscribe(&mut self, name: &str) -> Result<()> {
        self.session()?
            .unsubscribe(name)
            .await
            .with_context(|| format!("Failed to unsubscribe from '{}'", name))
    }

    async fn noop(&mut self) -> Result<()> {
        self.session()?.noop().await.context("NOOP failed")
    }

    fn supports_idle(&self) -> bool {
        self.supports_idle
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<IdleOutcome> {
        if *stop.borrow() {
            return Ok(IdleOutcome::Stopped);
        }

        let session = self.session.take().ok_or(ImapError::NotConnected)?;
        let mut handle = session.idle();
        if let Err(e) = handle.init().await {
            // The session may still be usable; put it back before reporting
            if let Ok(session) = handle.done().await {
                self.session = Some(session);
            }
            return Err(anyhow!(e).context("Failed to start IDLE"));
        }

        let outcome = {
            let (wait, stop_source) = handle.wait_with_timeout(timeout);
            tokio::pin!(wait);
            let response = tokio::select! {
                response = &mut wait => response,
                _ = stop.changed() => {
                    // Dropping the stop source interrupts the wait
                    drop(stop_source);
                    (&mut wait).await
                }
            };
            match response.context("IDLE wait failed")? {
                IdleResponse::NewData(_) => IdleOutcome::NewData,
                IdleResponse::Timeout => IdleOutcome::Timeout,
                IdleResponse::ManualInterrupt => IdleOutcome::Stopped,
            }
        };

        let session = handle.done().await.context("Failed to end IDLE")?;
        self.session = Some(session);
        Ok(outcome)
    }

    async fn logout(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.context("LOGOUT failed")?;
        }
        Ok(())
    }
}

fn fetched_message(fetch: &Fetch) -> Option<FetchedMessage> {
    let uid = fetch.uid?;
    let flags: Vec<Flag> = fetch.flags().collect();
    Some(FetchedMessage {
        uid,
        flags: parse_flags_from_imap(&flags),
        internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
        size: fetch.size,
        raw: fetch.body().map(<[u8]>::to_vec).unwrap_or_default(),
    })
}

/// Map LIST attributes, including RFC 6154 special-use markers.
fn folder_attributes(attrs: &[NameAttribute<'_>]) -> FolderAttributes {
    let mut out = FolderAttributes::empty();
    for attr in attrs {
        match attr {
            NameAttribute::NoSelect => out |= FolderAttributes::NO_SELECT,
            NameAttribute::NoInferiors => out |= FolderAttributes::NO_INFERIORS,
            NameAttribute::Marked => out |= FolderAttributes::MARKED,
            NameAttribute::Sent => out |= FolderAttributes::SENT,
            NameAttribute::Trash => out |= FolderAttributes::TRASH,
            NameAttribute::Drafts => out |= FolderAttributes::DRAFTS,
            NameAttribute::Junk => out |= FolderAttributes::JUNK,
            NameAttribute::Archive => out |= FolderAttributes::ARCHIVE,
            NameAttribute::Extension(label) => {
                if label.eq_ignore_ascii_case("\\HasChildren") {
                    out |= FolderAttributes::HAS_CHILDREN;
                } else if label.eq_ignore_ascii_case("\\NonExistent") {
                    out |= FolderAttributes::NO_SELECT;
                }
            }
            _ => {}
        }
    }
    out
}
