//! Database layer: pool setup, migrations and identity metadata.

use sqlx::{sqlite::SqlitePoolOptions, SqliteConnection, SqlitePool};
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::types::UserIdentity;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    // Make sure the file is created if it doesn't exist yet.
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };
    let url = if url.contains(":memory:") || url.contains("mode=") {
        url
    } else if url.contains('?') {
        format!("{url}&mode=rwc")
    } else {
        format!("{url}?mode=rwc")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Database migrations applied successfully");
    Ok(())
}

/// Single-connection in-memory pool; every connection of `sqlite::memory:`
/// would otherwise see its own empty database.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open in-memory SQLite");
    migrate(&pool).await.expect("Failed to run migrations");
    pool
}

/// Single-connection pool on a database file that reports lock contention
/// at once instead of waiting on SQLite's busy handler.
#[cfg(test)]
pub async fn file_pool(path: &std::path::Path) -> SqlitePool {
    let options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::ZERO);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to open SQLite file")
}

// ─────────────────────────────────────────────────────────
// Serialized write transactions
// ─────────────────────────────────────────────────────────

/// Open a write transaction.  `BEGIN IMMEDIATE` takes the write lock up
/// front so two writers never race to upgrade a shared lock; contention
/// surfaces as [`EngineError::AggregateWriteConflict`] for `key`.
pub async fn begin_immediate(conn: &mut SqliteConnection, key: &str) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE")
        .execute(&mut *conn)
        .await
        .map_err(|e| EngineError::from_write(e, key))?;
    Ok(())
}

/// Commit on success, roll back on any error (including a failed commit).
pub async fn finish<T>(conn: &mut SqliteConnection, key: &str, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(value),
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(EngineError::from_write(e, key))
            }
        },
        Err(e) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Identity metadata
// ─────────────────────────────────────────────────────────

/// Insert or replace the identity fields of a user (reputation is left untouched).
pub async fn upsert_user(
    pool: &SqlitePool,
    user_id: i64,
    wallet_address: Option<&str>,
    kyc_verified: bool,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (id, wallet_address, kyc_verified)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (id) DO UPDATE SET
            wallet_address = excluded.wallet_address,
            kyc_verified   = excluded.kyc_verified
        "#,
    )
    .bind(user_id)
    .bind(wallet_address)
    .bind(kyc_verified)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch a user's identity metadata.  Unknown users are treated as
/// unverified with no reputation score.
pub async fn get_user(pool: &SqlitePool, user_id: i64) -> Result<UserIdentity> {
    let row = sqlx::query_as::<_, UserIdentity>(
        r#"
        SELECT id, wallet_address, kyc_verified, reputation_score, reputation_refreshed_at
        FROM   users
        WHERE  id = ?1
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(UserIdentity {
        id: user_id,
        ..UserIdentity::default()
    }))
}

pub async fn save_reputation_score(
    pool: &SqlitePool,
    user_id: i64,
    score: f64,
    refreshed_at: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO users (id, reputation_score, reputation_refreshed_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (id) DO UPDATE SET
            reputation_score        = excluded.reputation_score,
            reputation_refreshed_at = excluded.reputation_refreshed_at
        "#,
    )
    .bind(user_id)
    .bind(score)
    .bind(refreshed_at)
    .execute(pool)
    .await?;
    Ok(())
}
