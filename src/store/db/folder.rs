//! Folder and sync cursor operations.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::mail::types::{Folder, SpecialUse};
use crate::store::SyncStatus;

fn row_to_folder(row: SqliteRow) -> Folder {
    Folder {
        account_id: row.get("account_id"),
        name: row.get("name"),
        delimiter: row.get("delimiter"),
        special_use: SpecialUse::from_bits_truncate(row.get::<i64, _>("special_use") as u32),
        selectable: row.get("selectable"),
        subscribed: row.get("subscribed"),
        has_children: row.get("has_children"),
    }
}

/// Insert a folder or refresh its metadata.
pub async fn upsert_folder(pool: &SqlitePool, folder: &Folder) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO folders (account_id, name, delimiter, special_use, selectable, subscribed, has_children)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(account_id, name) DO UPDATE SET
            delimiter = excluded.delimiter,
            special_use = excluded.special_use,
            selectable = excluded.selectable,
            subscribed = excluded.subscribed,
            has_children = excluded.has_children
        "#,
    )
    .bind(&folder.account_id)
    .bind(&folder.name)
    .bind(&folder.delimiter)
    .bind(folder.special_use.bits() as i64)
    .bind(folder.selectable)
    .bind(folder.subscribed)
    .bind(folder.has_children)
    .execute(pool)
    .await?;
    Ok(())
}

/// Rename a folder and carry its messages and cursor along.
pub async fn rename_folder(
    pool: &SqlitePool,
    account_id: &str,
    old_name: &str,
    new_name: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    for statement in [
        "UPDATE folders SET name = ? WHERE account_id = ? AND name = ?",
        "UPDATE emails SET folder = ? WHERE account_id = ? AND folder = ?",
        "UPDATE sync_status SET folder = ? WHERE account_id = ? AND folder = ?",
    ] {
        sqlx::query(statement)
            .bind(new_name)
            .bind(account_id)
            .bind(old_name)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn delete_folder(pool: &SqlitePool, account_id: &str, name: &str) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM emails WHERE account_id = ? AND folder = ?")
        .bind(account_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_status WHERE account_id = ? AND folder = ?")
        .bind(account_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM folders WHERE account_id = ? AND name = ?")
        .bind(account_id)
        .bind(name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

pub async fn get_folders(pool: &SqlitePool, account_id: &str) -> Result<Vec<Folder>> {
    let rows = sqlx::query(
        "SELECT account_id, name, delimiter, special_use, selectable, subscribed, has_children FROM folders WHERE account_id = ? ORDER BY name",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(row_to_folder).collect())
}

//
// Sync cursor
//

fn row_to_status(row: SqliteRow) -> SyncStatus {
    SyncStatus {
        account_id: row.get("account_id"),
        folder: row.get("folder"),
        last_sync: row
            .get::<Option<i64>, _>("last_sync")
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
        uid_validity: row.get::<Option<i64>, _>("uid_validity").map(|v| v as u32),
        last_uid: row.get::<i64, _>("last_uid") as u32,
    }
}

pub async fn get_sync_status(
    pool: &SqlitePool,
    account_id: &str,
    folder: &str,
) -> Result<Option<SyncStatus>> {
    let row = sqlx::query(
        "SELECT account_id, folder, last_sync, uid_validity, last_uid FROM sync_status WHERE account_id = ? AND folder = ?",
    )
    .bind(account_id)
    .bind(folder)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(row_to_status))
}

/// Upsert a cursor. `last_uid` only moves forward while the UID validity is unchanged.
pub async fn update_sync_status(pool: &SqlitePool, status: &SyncStatus) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_status (account_id, folder, last_sync, uid_validity, last_uid)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(account_id, folder) DO UPDATE SET
            last_uid = CASE
                WHEN sync_status.uid_validity IS excluded.uid_validity
                THEN MAX(sync_status.last_uid, excluded.last_uid)
                ELSE excluded.last_uid
            END,
            last_sync = excluded.last_sync,
            uid_validity = excluded.uid_validity
        "#,
    )
    .bind(&status.account_id)
    .bind(&status.folder)
    .bind(status.last_sync.map(|t| t.timestamp()))
    .bind(status.uid_validity.map(|v| v as i64))
    .bind(status.last_uid as i64)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_all_sync_status(pool: &SqlitePool, account_id: &str) -> Result<Vec<SyncStatus>> {
    let rows = sqlx::query(
        "SELECT account_id, folder, last_sync, uid_validity, last_uid FROM sync_status WHERE account_id = ? ORDER BY folder",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(row_to_status).collect())
}

pub async fn delete_sync_status(pool: &SqlitePool, account_id: &str, folder: &str) -> Result<()> {
    sqlx::query("DELETE FROM sync_status WHERE account_id = ? AND folder = ?")
        .bind(account_id)
        .bind(folder)
        .execute(pool)
        .await?;
    Ok(())
}
