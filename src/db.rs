use std::{str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use sqlx::{sqlite::{SqliteConnectOptions, SqlitePoolOptions}, FromRow, Sqlite, SqlitePool, Transaction};

/// Opaque id handed out by the auth provider.
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UserStatus {
    Online,
    Offline,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub image: Option<String>,
    pub status: UserStatus,
    pub last_seen: Option<i64>,
    pub bio: Option<String>,
    pub custom_status: Option<String>,

    // unique: id
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub chat_type: ChatType,
    pub created_at: i64,
    pub updated_at: i64,

    // unique: id
    // a direct chat has exactly two chat_members
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ChatMember {
    pub chat_id: String,
    pub user_id: UserId,

    // unique: chat_id, user_id
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: UserId,
    /// The other party of a direct chat; group messages have none.
    pub receiver_id: Option<UserId>,
    pub content: String,
    pub created_at: i64,
    pub read_at: Option<i64>,

    // unique: id
    // order within a chat lives in chat_messages.seq
}

pub const USER_COLUMNS: &str = "id,name,email,image,status,last_seen,bio,custom_status";
pub const CHAT_COLUMNS: &str = "id,name,chat_type,created_at,updated_at";
pub const MESSAGE_COLUMNS: &str = "id,chat_id,sender_id,receiver_id,content,created_at,read_at";

/// Opens the pool and applies the schema. In-memory databases live and die
/// with their connection, so those get exactly one that never idles out.
pub async fn connect(url: &str) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool_options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(16)
    };

    let db_pool = pool_options.connect_with(options).await?;
    init_schema(&db_pool).await?;
    Ok(db_pool)
}

pub async fn init_schema(db_pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(include_str!("schema.sql"))
        .execute(db_pool)
        .await?;
    Ok(())
}

/// Opens a transaction that holds the write lock from the start. Use it when
/// the transaction reads before it writes: a deferred one cannot upgrade its
/// lock while another connection writes, and fails with `SQLITE_BUSY`.
pub async fn begin_write(db_pool: &SqlitePool) -> sqlx::Result<Transaction<'static, Sqlite>> {
    db_pool.begin_with("BEGIN IMMEDIATE").await
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
pub(crate) mod testing {
    use sqlx::SqlitePool;
    use tokio::sync::broadcast;

    use crate::{auth::{ensure_user, ProviderProfile}, events::Envelope};

    use super::User;

    pub(crate) async fn pool() -> SqlitePool {
        super::connect("sqlite::memory:").await.unwrap()
    }

    /// A pool over a fresh database file, for tests that need more than one
    /// connection. Keep the directory alive as long as the pool.
    pub(crate) async fn file_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("clonecord.db").display());
        (dir, super::connect(&url).await.unwrap())
    }

    pub(crate) fn events() -> (broadcast::Sender<Envelope>, broadcast::Receiver<Envelope>) {
        broadcast::channel(64)
    }

    pub(crate) async fn user(db_pool: &SqlitePool, id: &str, name: &str) -> User {
        ensure_user(db_pool, id, ProviderProfile {
            name: Some(name.to_owned()),
            email: Some(format!("{id}@example.com")),
            image: None,
        })
        .await
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db_pool = testing::pool().await;
        init_schema(&db_pool).await.unwrap();

        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('users','chats','chat_members','messages','chat_messages','chat_reads')"
        )
            .fetch_one(&db_pool)
            .await
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[tokio::test]
    async fn enums_round_trip_as_text() {
        let db_pool = testing::pool().await;
        testing::user(&db_pool, "u1", "Ada").await;

        let (status,): (String,) = sqlx::query_as("SELECT status FROM users WHERE id='u1'")
            .fetch_one(&db_pool)
            .await
            .unwrap();
        assert_eq!(status, "online");

        let (status,): (UserStatus,) = sqlx::query_as("SELECT status FROM users WHERE id='u1'")
            .fetch_one(&db_pool)
            .await
            .unwrap();
        assert_eq!(status, UserStatus::Online);
    }

    #[test]
    fn now_is_in_milliseconds() {
        // 2020-01-01 in ms; seconds would be far smaller
        assert!(now_ms() > 1_577_836_800_000);
    }
}
