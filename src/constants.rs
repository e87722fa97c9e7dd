//! Bridge-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Default number of messages fetched per bulk FETCH during sync.
/// Also the value an invalid batch size is clamped to.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Upper bound for a configured batch size.
pub const MAX_BATCH_SIZE: usize = 100;

/// Concurrent parse-and-store tasks per fetched batch.
pub const BATCH_CONCURRENCY: usize = 5;

/// Batch size for flag sync operations.
/// Prevents IMAP command line length limits (~8KB).
pub const FLAG_SYNC_BATCH_SIZE: usize = 500;

/// IDLE connection timeout in seconds before refresh.
/// RFC 3501 recommends 29 minutes; we use 5 minutes for reliability.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Sleep between scans when the server does not advertise IDLE.
pub const POLL_INTERVAL_SECS: u64 = 60;

/// Base delay for reconnect backoff.
pub const BACKOFF_BASE_SECS: u64 = 1;

/// Maximum retry delay in seconds for connection attempts.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Maximum number of consecutive monitor failures before it stops.
pub const MAX_RETRIES: u32 = 10;

/// Capacity of the reconnect request queue. Requests beyond it are dropped.
pub const RECONNECT_QUEUE_CAPACITY: usize = 100;

/// Default interval of the connection health check.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Default interval of the periodic folder reconciliation.
pub const FOLDER_SYNC_INTERVAL_MINS: u64 = 15;

/// Header carrying the server UID inside stored message metadata.
pub const UID_HEADER: &str = "X-IMAP-UID";

/// Logical client id prefixes used by the connection registry.
pub const IMAP_CLIENT_PREFIX: &str = "imap-";
pub const SMTP_CLIENT_PREFIX: &str = "smtp-";
