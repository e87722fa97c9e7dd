//! Attachment metadata operations.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::mail::types::Attachment;

fn row_to_attachment(row: SqliteRow) -> Attachment {
    Attachment {
        id: row.get("id"),
        email_id: row.get("email_id"),
        filename: row.get("filename"),
        content_type: row
            .get::<Option<String>, _>("content_type")
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        size: row.get::<i64, _>("size") as usize,
        content_id: row.get("content_id"),
    }
}

/// Insert attachment metadata inside the message transaction.
pub async fn insert_attachments(
    tx: &mut Transaction<'_, Sqlite>,
    attachments: &[Attachment],
) -> Result<()> {
    for attachment in attachments {
        sqlx::query(
            "INSERT OR REPLACE INTO attachments (id, email_id, filename, content_type, size, content_id) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&attachment.id)
        .bind(&attachment.email_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size as i64)
        .bind(&attachment.content_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub async fn get_attachments(pool: &SqlitePool, email_id: &str) -> Result<Vec<Attachment>> {
    let rows = sqlx::query(
        "SELECT id, email_id, filename, content_type, size, content_id FROM attachments WHERE email_id = ? ORDER BY rowid",
    )
    .bind(email_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(row_to_attachment).collect())
}

pub async fn get_attachment(pool: &SqlitePool, id: &str) -> Result<Option<Attachment>> {
    let row = sqlx::query(
        "SELECT id, email_id, filename, content_type, size, content_id FROM attachments WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(row_to_attachment))
}
