use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, Tokio1Executor};

use crate::config::{AccountConfig, AuthMethod, SmtpConfig};
use crate::connection::ManagedConnection;

/// Implicit TLS submission port; every other port negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

/// Supervised SMTP endpoint. "Connecting" means a successful handshake and login test.
pub struct SmtpClient {
    account_id: String,
    server: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    connected: AtomicBool,
}

impl SmtpClient {
    /// Build from an account whose secrets are already decrypted.
    pub fn new(account: &AccountConfig) -> Result<Option<Self>> {
        let Some(config) = &account.smtp else {
            return Ok(None);
        };

        let username = config
            .username
            .clone()
            .unwrap_or_else(|| account.email.clone());
        let (secret, mechanisms) = match &account.auth {
            AuthMethod::Password => (
                config.password.clone(),
                vec![Mechanism::Plain, Mechanism::Login],
            ),
            AuthMethod::OAuth2 { access_token, .. } => {
                (access_token.clone(), vec![Mechanism::Xoauth2])
            }
        };

        let transport = build_transport(config)?
            .credentials(Credentials::new(username, secret))
            .authentication(mechanisms)
            .build();

        Ok(Some(Self {
            account_id: account.id.clone(),
            server: config.server.clone(),
            transport,
            connected: AtomicBool::new(false),
        }))
    }

    pub async fn connect(&self) -> Result<()> {
        let ok = self
            .transport
            .test_connection()
            .await
            .with_context(|| format!("SMTP connection to {} failed", self.server))?;
        self.connected.store(ok, Ordering::Relaxed);
        if !ok {
            bail!("SMTP server {} rejected the connection test", self.server);
        }
        tracing::info!(
            "SMTP for '{}' reachable at {}",
            self.account_id,
            self.server
        );
        Ok(())
    }
}

fn build_transport(
    config: &SmtpConfig,
) -> Result<lettre::transport::smtp::AsyncSmtpTransportBuilder> {
    let builder = if !config.tls {
        tracing::warn!("SMTP TLS disabled for {}", config.server);
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
    } else if config.port == SMTPS_PORT {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
            .context("Failed to create SMTP transport")?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
            .context("Failed to create SMTP transport")?
    };
    Ok(builder.port(config.port))
}

#[async_trait]
impl ManagedConnection for SmtpClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn reconnect(&self) -> Result<()> {
        self.connect().await.inspect_err(|_| {
            self.connected.store(false, Ordering::Relaxed);
        })
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        Ok(())
    }
}
