use axum::{debug_handler, extract::State, Json};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tower_sessions::Session;

use crate::{
    db,
    events::{publish, Audience, ChatEvent, Envelope},
    session::require_user,
    ApiPath, AppResult, AppState,
};

use super::{members_of, require_member};

#[derive(Debug, Serialize)]
pub(crate) struct LastRead {
    last_read_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct Unread {
    unread_count: i64,
}

/// A member's last-read position: the newest message they have seen and
/// when they saw it.
#[derive(Debug, Clone, Copy, PartialEq, FromRow)]
pub(crate) struct ReadMark {
    pub(crate) last_read_at: i64,
    pub(crate) last_read_seq: i64,
}

/// Raises the mark to `at`/`seq` unless it is already past them. Returns the
/// stored mark.
pub(crate) async fn advance_last_read(conn: &mut SqliteConnection, chat_id: &str, user_id: &str, at: i64, seq: i64) -> sqlx::Result<ReadMark> {
    sqlx::query_as(
        "INSERT INTO chat_reads (chat_id,user_id,last_read_at,last_read_seq) VALUES (?,?,?,?)
        ON CONFLICT (chat_id,user_id) DO UPDATE SET
            last_read_at=MAX(last_read_at,excluded.last_read_at),
            last_read_seq=MAX(last_read_seq,excluded.last_read_seq)
        RETURNING last_read_at,last_read_seq"
    )
        .bind(chat_id)
        .bind(user_id)
        .bind(at)
        .bind(seq)
        .fetch_one(&mut *conn)
        .await
}

/// Messages past the user's last-read position, counted fresh each time.
/// Positions are `chat_messages.seq`, so two messages sent in the same
/// millisecond still count separately.
pub(crate) async fn count_unread(db_pool: &SqlitePool, chat_id: &str, user_id: &str) -> AppResult<i64> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM chat_messages
        WHERE chat_id=? AND seq > COALESCE(
            (SELECT last_read_seq FROM chat_reads WHERE chat_id=? AND user_id=?), 0)"
    )
        .bind(chat_id)
        .bind(chat_id)
        .bind(user_id)
        .fetch_one(db_pool)
        .await?;
    Ok(count)
}

pub async fn unread_count(db_pool: &SqlitePool, user_id: &str, chat_id: &str) -> AppResult<i64> {
    require_member(db_pool, chat_id, user_id).await?;
    count_unread(db_pool, chat_id, user_id).await
}

/// Moves the user's mark up to the newest message and stamps `read_at` on
/// what was sent to them.
pub async fn mark_read(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    chat_id: &str,
) -> AppResult<i64> {
    require_member(db_pool, chat_id, user_id).await?;
    let now = db::now_ms();

    let mut tx = db::begin_write(db_pool).await?;
    let (newest,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq),0) FROM chat_messages WHERE chat_id=?")
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await?;
    let ReadMark { last_read_at, last_read_seq } = advance_last_read(&mut tx, chat_id, user_id, now, newest).await?;
    sqlx::query(
        "UPDATE messages SET read_at=? WHERE receiver_id=? AND read_at IS NULL
        AND id IN (SELECT message_id FROM chat_messages WHERE chat_id=? AND seq<=?)"
    )
        .bind(now)
        .bind(user_id)
        .bind(chat_id)
        .bind(last_read_seq)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let members = members_of(db_pool, chat_id).await?;
    publish(events, Audience::Users(members), ChatEvent::ChatRead {
        chat_id: chat_id.to_owned(),
        user_id: user_id.to_owned(),
        last_read_at,
    });
    Ok(last_read_at)
}

#[debug_handler(state = AppState)]
pub(crate) async fn read(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiPath(chat_id): ApiPath<String>,
) -> AppResult<Json<LastRead>> {
    let user_id = require_user(&session).await?;
    let last_read_at = mark_read(&db_pool, &events, &user_id, &chat_id).await?;
    Ok(Json(LastRead { last_read_at }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn unread(
    State(db_pool): State<SqlitePool>,
    session: Session,
    ApiPath(chat_id): ApiPath<String>,
) -> AppResult<Json<Unread>> {
    let user_id = require_user(&session).await?;
    let unread_count = unread_count(&db_pool, &user_id, &chat_id).await?;
    Ok(Json(Unread { unread_count }))
}
