//! Database schema initialization.

use anyhow::Result;
use sqlx::SqlitePool;

/// Initialize database schema with all tables and indexes.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS folders (
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            delimiter TEXT,
            special_use INTEGER NOT NULL DEFAULT 0,
            selectable INTEGER NOT NULL DEFAULT 1,
            subscribed INTEGER NOT NULL DEFAULT 0,
            has_children INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, name)
        );

        CREATE TABLE IF NOT EXISTS emails (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            folder TEXT NOT NULL,
            uid INTEGER NOT NULL,
            message_id TEXT NOT NULL DEFAULT '',
            from_name TEXT,
            from_email TEXT NOT NULL DEFAULT '',
            subject TEXT NOT NULL DEFAULT '',
            date INTEGER NOT NULL DEFAULT 0,
            is_read INTEGER NOT NULL DEFAULT 0,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            text_content TEXT,
            html_content TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_emails_account_folder ON emails(account_id, folder);
        CREATE INDEX IF NOT EXISTS idx_emails_date ON emails(date DESC);
        CREATE INDEX IF NOT EXISTS idx_emails_message_id ON emails(message_id);
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recipients (
            email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            position INTEGER NOT NULL,
            name TEXT,
            email TEXT NOT NULL,
            PRIMARY KEY (email_id, kind, position)
        );

        CREATE TABLE IF NOT EXISTS email_headers (
            email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (email_id, name)
        );

        CREATE TABLE IF NOT EXISTS attachments (
            id TEXT PRIMARY KEY,
            email_id TEXT NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
            filename TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL,
            size INTEGER NOT NULL DEFAULT 0,
            content_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_attachments_email ON attachments(email_id);

        -- Sync cursor per folder
        CREATE TABLE IF NOT EXISTS sync_status (
            account_id TEXT NOT NULL,
            folder TEXT NOT NULL,
            last_sync INTEGER,
            uid_validity INTEGER,
            last_uid INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, folder)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (1)")
        .execute(pool)
        .await?;

    Ok(())
}
