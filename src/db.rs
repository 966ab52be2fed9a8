use std::time::Duration;

use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};

use crate::identity::UserRecord;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        external_id TEXT UNIQUE NOT NULL,
        first_name TEXT,
        last_name TEXT,
        email TEXT NOT NULL,
        avatar TEXT
    )"#,
    // author_id may point at a user that no longer exists
    r#"CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        room_id TEXT NOT NULL,
        author_id TEXT,
        text TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS messages_room_created ON messages (room_id, created_at)",
];

/// Opens a pool for `url`.
///
/// Every connection to `:memory:` gets its own empty database, so in-memory
/// pools are pinned to a single connection that is never recycled.
pub async fn open(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    };

    options.connect(url).await
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    tracing::debug!("schema is up to date");
    Ok(())
}

/// Inserts or replaces a user record. The user store belongs to the wider
/// application; this is used for seeding.
pub async fn insert_user(db_pool: &SqlitePool, user: &UserRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO users (id,external_id,first_name,last_name,email,avatar) VALUES (?,?,?,?,?,?)",
    )
    .bind(&user.id)
    .bind(&user.external_id)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.email)
    .bind(&user.avatar)
    .execute(db_pool)
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let db_pool = open("sqlite::memory:", 1).await.unwrap();
    migrate(&db_pool).await.unwrap();
    db_pool
}
