mod account;
mod config;
mod connection;
mod constants;
mod credentials;
mod events;
mod mail;
mod retry;
mod store;
mod sync;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::account::AccountManager;
use crate::config::Config;
use crate::credentials::{AesGcmCipher, CredentialCipher};
use crate::events::{Dispatcher, EventHandler, log_subscriber};
use crate::store::SqliteStore;
use crate::sync::IncrementalSyncOptions;

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mailbridge=debug"));

    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir))
        .map(|dir| dir.join("mailbridge.log"))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"mailbridge - IMAP/SMTP to local store sync bridge

Usage: mailbridge [command]

Commands:
    run                            Sync, then watch every account until Ctrl-C (default)
    sync <account> [folder] [--full]
                                   Run one sync pass and exit
    folders <account>              Reconcile and list the folders of an account
    encrypt                        Encrypt a secret for the config file
    help                           Show this help message

Configuration file: ~/.config/mailbridge/config.toml
Log file:           ~/.config/mailbridge/mailbridge.log
"#
    );
}

/// Store, event pipeline and account services shared by every command.
struct Bridge {
    config: Config,
    accounts: AccountManager,
}

impl Bridge {
    async fn open() -> Result<Self> {
        let config = Config::load()?;
        config.ensure_dirs()?;

        let cipher = AesGcmCipher::load_or_create(&config.key_file_path()?)?;
        let store = Arc::new(SqliteStore::open(&config.database_path()?).await?);
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.subscribe_all(log_subscriber()).await;
        let events = EventHandler::new(store, dispatcher);
        let accounts = AccountManager::new(&config, &cipher, events).await?;

        Ok(Self { config, accounts })
    }
}

async fn run_bridge() -> Result<()> {
    let bridge = Bridge::open().await?;
    if bridge.accounts.count() == 0 {
        anyhow::bail!("No accounts configured in {}", Config::config_path()?.display());
    }

    let synced = bridge.accounts.sync_all().await;
    tracing::info!(
        "Initial sync finished for {}/{} account(s)",
        synced,
        bridge.accounts.count()
    );

    bridge.accounts.start().await;
    tracing::info!(
        "Supervising {}",
        bridge.accounts.connections().ids().await.join(", ")
    );
    println!(
        "mailbridge running for {} account(s). Press Ctrl-C to stop.",
        bridge.accounts.count()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("Shutting down...");
    bridge.accounts.shutdown().await;

    for handle in bridge.accounts.iter() {
        let status = handle.status().await;
        match (status.last_sync, status.last_error) {
            (_, Some(error)) => println!("{}: last sync failed: {}", handle.display_name(), error),
            (Some(at), None) => println!("{}: last synced {}", handle.display_name(), at),
            (None, None) => println!("{}: never synced", handle.display_name()),
        }
    }
    Ok(())
}

async fn run_sync(args: &[String]) -> Result<()> {
    let full = args.iter().any(|a| a == "--full");
    let mut positional = args.iter().filter(|a| !a.starts_with("--"));
    let account_id = positional
        .next()
        .context("Usage: mailbridge sync <account> [folder] [--full]")?;
    let folder = positional.next();

    let bridge = Bridge::open().await?;
    let handle = bridge.accounts.require(account_id)?;

    let mut options = IncrementalSyncOptions {
        sync: handle.sync_options(&bridge.config.sync),
        check_status_changes: bridge.config.sync.check_status_changes,
    };
    options.sync.folder = folder.cloned();
    options.sync.on_progress = Some(Arc::new(|folder: &str, current: usize, total: usize| {
        println!("  {}: {}/{}", folder, current, total);
    }));

    if full {
        let folders = match folder {
            Some(folder) => vec![folder.clone()],
            None => handle
                .reconciler()
                .server_folders()
                .await?
                .into_iter()
                .filter(|f| f.selectable)
                .map(|f| f.name)
                .collect(),
        };
        for folder in &folders {
            handle.synchronizer().reset_folder(folder).await?;
        }
    }

    let report = handle.synchronizer().sync_incremental(&options).await?;
    println!(
        "{} folder(s): {} fetched, {} full sync(s), {} purged, {} status change(s), {} removed",
        report.folders,
        report.fetched,
        report.full_syncs,
        report.purged,
        report.status_changes,
        report.removed
    );
    handle.imap().disconnect().await.ok();
    Ok(())
}

async fn run_folders(args: &[String]) -> Result<()> {
    let account_id = args
        .first()
        .context("Usage: mailbridge folders <account>")?;

    let bridge = Bridge::open().await?;
    let handle = bridge.accounts.require(account_id)?;

    let report = bridge.accounts.folder_watcher().sync_account(account_id).await?;

    println!("{:<40} {:<12} {:<10} SUBSCRIBED", "FOLDER", "ROLE", "SELECT");
    for folder in &report.folders {
        println!(
            "{:<40} {:<12} {:<10} {}",
            folder.name,
            format!("{:?}", folder.special_use),
            folder.selectable,
            folder.subscribed
        );
    }
    if !report.created_local.is_empty() {
        println!("Added locally: {}", report.created_local.join(", "));
    }
    if !report.created_remote.is_empty() {
        println!("Created on server: {}", report.created_remote.join(", "));
    }
    handle.imap().disconnect().await.ok();
    Ok(())
}

fn run_encrypt() -> Result<()> {
    use std::io::{self, Write};

    let config = Config::load().unwrap_or_default();
    let cipher = AesGcmCipher::load_or_create(&config.key_file_path()?)?;

    print!("Secret: ");
    io::stdout().flush()?;
    let secret = read_secret()?;
    println!();

    if secret.is_empty() {
        anyhow::bail!("Nothing to encrypt");
    }
    println!("{}", cipher.encrypt(&secret)?);
    Ok(())
}

fn read_secret() -> Result<String> {
    use std::io;

    // Disable echo
    let _guard = DisableEcho::new()?;

    let mut secret = String::new();
    io::stdin().read_line(&mut secret)?;
    Ok(secret.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut silent = original;
            silent.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &silent) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let rest = args.get(2..).unwrap_or_default();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("encrypt") => run_encrypt(),
        Some("sync") => {
            setup_logging();
            run_sync(rest).await
        }
        Some("folders") => {
            setup_logging();
            run_folders(rest).await
        }
        Some("run") | None => {
            setup_logging();
            run_bridge().await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
