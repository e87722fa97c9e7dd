//! Message CRUD operations.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::DateTime;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::attachment;
use crate::mail::types::{Address, Message};
use crate::store::{MessageState, StoreQuery};

const MESSAGE_COLUMNS: &str = "id, account_id, folder, uid, message_id, from_name, from_email, subject, date, is_read, has_attachments, text_content, html_content";

/// Convert a SQLite row to a Message without recipients, headers or attachments.
fn row_to_message(row: SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        account_id: row.get("account_id"),
        folder: row.get("folder"),
        uid: row.get::<i64, _>("uid") as u32,
        message_id: row.get("message_id"),
        from: Address {
            name: row.get("from_name"),
            email: row.get("from_email"),
        },
        to: Vec::new(),
        cc: Vec::new(),
        bcc: Vec::new(),
        subject: row.get("subject"),
        date: DateTime::from_timestamp(row.get::<i64, _>("date"), 0)
            .unwrap_or(DateTime::UNIX_EPOCH),
        is_read: row.get("is_read"),
        has_attachments: row.get("has_attachments"),
        headers: BTreeMap::new(),
        text_content: row.get("text_content"),
        html_content: row.get("html_content"),
        attachments: Vec::new(),
    }
}

/// Insert or replace a message and all of its child rows in one transaction.
pub async fn insert_message(pool: &SqlitePool, message: &Message) -> Result<()> {
    let mut tx = pool.begin().await?;

    // Child rows are rewritten from scratch on every store
    for table in ["recipients", "email_headers", "attachments"] {
        sqlx::query(&format!("DELETE FROM {} WHERE email_id = ?", table))
            .bind(&message.id)
            .execute(&mut *tx)
            .await?;
    }

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO emails
        (id, account_id, folder, uid, message_id, from_name, from_email, subject, date, is_read, has_attachments, text_content, html_content)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(&message.account_id)
    .bind(&message.folder)
    .bind(message.uid as i64)
    .bind(&message.message_id)
    .bind(&message.from.name)
    .bind(&message.from.email)
    .bind(&message.subject)
    .bind(message.date.timestamp())
    .bind(message.is_read)
    .bind(message.has_attachments)
    .bind(&message.text_content)
    .bind(&message.html_content)
    .execute(&mut *tx)
    .await?;

    for (kind, list) in [("to", &message.to), ("cc", &message.cc), ("bcc", &message.bcc)] {
        for (position, addr) in list.iter().enumerate() {
            sqlx::query(
                "INSERT INTO recipients (email_id, kind, position, name, email) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&message.id)
            .bind(kind)
            .bind(position as i64)
            .bind(&addr.name)
            .bind(&addr.email)
            .execute(&mut *tx)
            .await?;
        }
    }

    for (name, value) in &message.headers {
        sqlx::query("INSERT INTO email_headers (email_id, name, value) VALUES (?, ?, ?)")
            .bind(&message.id)
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }

    attachment::insert_attachments(&mut tx, &message.attachments).await?;

    tx.commit().await?;
    Ok(())
}

/// Fill recipients, headers and attachments of a loaded message.
async fn load_children(pool: &SqlitePool, message: &mut Message) -> Result<()> {
    let rows = sqlx::query(
        "SELECT kind, name, email FROM recipients WHERE email_id = ? ORDER BY kind, position",
    )
    .bind(&message.id)
    .fetch_all(pool)
    .await?;

    for row in rows {
        let addr = Address {
            name: row.get("name"),
            email: row.get("email"),
        };
        match row.get::<String, _>("kind").as_str() {
            "to" => message.to.push(addr),
            "cc" => message.cc.push(addr),
            "bcc" => message.bcc.push(addr),
            _ => {}
        }
    }

    let rows = sqlx::query("SELECT name, value FROM email_headers WHERE email_id = ?")
        .bind(&message.id)
        .fetch_all(pool)
        .await?;
    message.headers = rows
        .into_iter()
        .map(|row| (row.get("name"), row.get("value")))
        .collect();

    message.attachments = attachment::get_attachments(pool, &message.id).await?;
    Ok(())
}

pub async fn get_message(pool: &SqlitePool, id: &str) -> Result<Option<Message>> {
    let row = sqlx::query(&format!("SELECT {} FROM emails WHERE id = ?", MESSAGE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let mut message = row_to_message(row);
    load_children(pool, &mut message).await?;
    Ok(Some(message))
}

/// Search stored messages, newest first.
pub async fn search_messages(pool: &SqlitePool, query: &StoreQuery) -> Result<Vec<Message>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {} FROM emails WHERE account_id = ",
        MESSAGE_COLUMNS
    ));
    builder.push_bind(&query.account_id);

    if let Some(folder) = &query.folder {
        builder.push(" AND folder = ").push_bind(folder);
    }
    if let Some(is_read) = query.is_read {
        builder.push(" AND is_read = ").push_bind(is_read);
    }
    if let Some(text) = &query.text {
        let pattern = format!("%{}%", text);
        builder
            .push(" AND (subject LIKE ")
            .push_bind(pattern.clone())
            .push(" OR from_email LIKE ")
            .push_bind(pattern.clone())
            .push(" OR text_content LIKE ")
            .push_bind(pattern)
            .push(")");
    }

    builder.push(" ORDER BY date DESC, uid DESC");
    let limit = if query.limit == 0 { -1 } else { query.limit as i64 };
    builder
        .push(" LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(query.offset as i64);

    let rows = builder.build().fetch_all(pool).await?;

    let mut messages = Vec::with_capacity(rows.len());
    for row in rows {
        let mut message = row_to_message(row);
        load_children(pool, &mut message).await?;
        messages.push(message);
    }
    Ok(messages)
}

/// Id, UID and read flag of every message in a folder.
///
/// The UID comes from the stored `X-IMAP-UID` header when present.
pub async fn message_states(
    pool: &SqlitePool,
    account_id: &str,
    folder: &str,
) -> Result<Vec<MessageState>> {
    let rows = sqlx::query(
        r#"
        SELECT e.id, e.uid, e.is_read, h.value AS header_uid
        FROM emails e
        LEFT JOIN email_headers h ON h.email_id = e.id AND h.name = ?
        WHERE e.account_id = ? AND e.folder = ?
        ORDER BY e.uid
        "#,
    )
    .bind(crate::constants::UID_HEADER)
    .bind(account_id)
    .bind(folder)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let column_uid = row.get::<i64, _>("uid") as u32;
            let uid = row
                .get::<Option<String>, _>("header_uid")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(column_uid);
            MessageState {
                id: row.get("id"),
                uid,
                is_read: row.get("is_read"),
            }
        })
        .collect())
}

pub async fn update_status(pool: &SqlitePool, id: &str, is_read: bool) -> Result<bool> {
    let result = sqlx::query("UPDATE emails SET is_read = ? WHERE id = ?")
        .bind(is_read)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn move_message(pool: &SqlitePool, id: &str, folder: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE emails SET folder = ? WHERE id = ?")
        .bind(folder)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_message(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM emails WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn purge_folder(pool: &SqlitePool, account_id: &str, folder: &str) -> Result<usize> {
    let result = sqlx::query("DELETE FROM emails WHERE account_id = ? AND folder = ?")
        .bind(account_id)
        .bind(folder)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() as usize)
}

pub async fn count_messages(pool: &SqlitePool, account_id: &str, folder: &str) -> Result<usize> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE account_id = ? AND folder = ?")
            .bind(account_id)
            .bind(folder)
            .fetch_one(pool)
            .await?;
    Ok(count as usize)
}
