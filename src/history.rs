use async_trait::async_trait;
use sqlx::SqlitePool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    identity::display_name,
    models::{Author, ChatMessage},
};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("stored message has an invalid id: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("stored message has an invalid timestamp: {0}")]
    InvalidTimestamp(#[from] time::error::ComponentRange),
}

/// Persistent transcripts, one per room.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Stores `message` in its room's transcript. Safe to call concurrently for the same room.
    async fn append(&self, message: &ChatMessage) -> Result<(), HistoryError>;

    /// Full transcript of `room_id`, oldest first. Unknown rooms have an empty transcript.
    async fn list(&self, room_id: &str) -> Result<Vec<ChatMessage>, HistoryError>;
}

#[derive(Debug, Clone)]
pub struct SqliteHistoryStore {
    db_pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[derive(sqlx::FromRow)]
struct TranscriptRow {
    id: String,
    room_id: String,
    text: String,
    created_at: i64,
    author_id: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    avatar: Option<String>,
}

impl TryFrom<TranscriptRow> for ChatMessage {
    type Error = HistoryError;

    fn try_from(row: TranscriptRow) -> Result<Self, Self::Error> {
        // a user row always has an email, so its absence means the join found nobody
        let author = match (row.author_id, row.email) {
            (Some(id), Some(email)) => Author {
                name: display_name(row.first_name.as_deref(), row.last_name.as_deref(), &email),
                id: Some(id),
                avatar: row.avatar,
            },
            _ => Author::anonymous(),
        };

        Ok(ChatMessage {
            id: Uuid::parse_str(&row.id)?,
            room_id: row.room_id,
            text: row.text,
            created_at: OffsetDateTime::from_unix_timestamp_nanos(i128::from(row.created_at) * 1_000_000)?,
            author,
        })
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(&self, message: &ChatMessage) -> Result<(), HistoryError> {
        sqlx::query("INSERT INTO messages (id,room_id,author_id,text,created_at) VALUES (?,?,?,?,?)")
            .bind(message.id.to_string())
            .bind(&message.room_id)
            .bind(&message.author.id)
            .bind(&message.text)
            .bind(message.created_at_millis())
            .execute(&self.db_pool)
            .await?;

        Ok(())
    }

    async fn list(&self, room_id: &str) -> Result<Vec<ChatMessage>, HistoryError> {
        let rows: Vec<TranscriptRow> = sqlx::query_as(
            r#"SELECT m.id, m.room_id, m.text, m.created_at, m.author_id,
                      u.first_name, u.last_name, u.email, u.avatar
               FROM messages m LEFT JOIN users u ON u.id = m.author_id
               WHERE m.room_id = ?
               ORDER BY m.created_at ASC, m.id ASC"#,
        )
        .bind(room_id)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(ChatMessage::try_from).collect()
    }
}
