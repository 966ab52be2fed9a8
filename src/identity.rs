use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;

/// Display metadata for a message author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

/// A row of the user store.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: String,
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub avatar: Option<String>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, external_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            external_id: external_id.into(),
            first_name: None,
            last_name: None,
            email: email.into(),
            avatar: None,
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }
}

impl From<UserRecord> for Identity {
    fn from(user: UserRecord) -> Self {
        Identity {
            name: display_name(user.first_name.as_deref(), user.last_name.as_deref(), &user.email),
            id: user.id,
            avatar: user.avatar,
        }
    }
}

/// `"first last"` when both names are present and non-blank, otherwise the email.
pub fn display_name(first_name: Option<&str>, last_name: Option<&str>, email: &str) -> String {
    fn non_blank(name: Option<&str>) -> Option<&str> {
        name.map(str::trim).filter(|name| !name.is_empty())
    }

    match (non_blank(first_name), non_blank(last_name)) {
        (Some(first), Some(last)) => format!("{first} {last}"),
        _ => email.to_owned(),
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Looks up message authors by the external id a client connected with.
///
/// `Ok(None)` means no user matches; that is an expected outcome for stale or
/// malformed ids and is not reported as an error.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, external_id: &str) -> Result<Option<Identity>, IdentityError>;
}

#[derive(Debug, Clone)]
pub struct SqliteIdentityResolver {
    db_pool: SqlitePool,
}

impl SqliteIdentityResolver {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl IdentityResolver for SqliteIdentityResolver {
    async fn resolve(&self, external_id: &str) -> Result<Option<Identity>, IdentityError> {
        let user: Option<UserRecord> = sqlx::query_as(
            "SELECT id,external_id,first_name,last_name,email,avatar FROM users WHERE external_id=?",
        )
        .bind(external_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(user.map(Identity::from))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db;

    #[test]
    fn display_name_joins_first_and_last() {
        assert_eq!(display_name(Some("A"), Some("B"), "a@b.com"), "A B");
    }

    #[test]
    fn display_name_trims_each_name() {
        assert_eq!(display_name(Some(" Alice "), Some("Smith\n"), "x@y.com"), "Alice Smith");
    }

    #[test]
    fn display_name_falls_back_to_email() {
        assert_eq!(display_name(None, None, "x@y.com"), "x@y.com");
        assert_eq!(display_name(Some("Alice"), None, "x@y.com"), "x@y.com");
        assert_eq!(display_name(None, Some("Smith"), "x@y.com"), "x@y.com");
        assert_eq!(display_name(Some("Alice"), Some("  "), "x@y.com"), "x@y.com");
        assert_eq!(display_name(Some(""), Some("Smith"), "x@y.com"), "x@y.com");
    }

    #[tokio::test]
    async fn resolves_by_external_id() {
        let db_pool = db::memory_pool().await;
        db::insert_user(
            &db_pool,
            &UserRecord::new("u-alice", "alice", "alice@x.com")
                .with_name("Alice", "Smith")
                .with_avatar("/uploads/alice.png"),
        )
        .await
        .unwrap();

        let resolver = SqliteIdentityResolver::new(db_pool);
        let identity = resolver.resolve("alice").await.unwrap();

        assert_eq!(
            identity,
            Some(Identity {
                id: "u-alice".to_owned(),
                name: "Alice Smith".to_owned(),
                avatar: Some("/uploads/alice.png".to_owned()),
            })
        );
    }

    #[tokio::test]
    async fn internal_id_is_not_an_external_id() {
        let db_pool = db::memory_pool().await;
        db::insert_user(&db_pool, &UserRecord::new("u-bob", "bob", "bob@x.com"))
            .await
            .unwrap();

        let resolver = SqliteIdentityResolver::new(db_pool);

        assert_eq!(resolver.resolve("u-bob").await.unwrap(), None);
        assert_eq!(resolver.resolve("bob").await.unwrap().unwrap().name, "bob@x.com");
    }
}
