use axum::{debug_handler, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    db::{self, ChatType, Message, UserId, MESSAGE_COLUMNS},
    events::{publish, Audience, ChatEvent, Envelope},
    session::require_user,
    ApiJson, ApiPath, AppResult, AppState, ChatError,
};

use super::{members_of, new::find_or_create_direct_chat, read::advance_last_read, require_member};

#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageQuery {
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DirectMessageQuery {
    receiver_id: UserId,
    content: String,
}

/// Appends a message to the chat and moves the sender's last-read mark up
/// to it.
pub async fn send_message(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    chat_id: &str,
    content: &str,
) -> AppResult<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::Invalid("Message cannot be empty".to_owned()))?;
    }

    let chat = require_member(db_pool, chat_id, user_id).await?;
    let members = members_of(db_pool, chat_id).await?;
    let receiver_id = match chat.chat_type {
        ChatType::Direct => members.iter().find(|member| *member != user_id).cloned(),
        ChatType::Group => None,
    };

    let now = db::now_ms();
    let mut tx = db::begin_write(db_pool).await?;

    let message: Message = sqlx::query_as(&format!(
        "INSERT INTO messages (id,chat_id,sender_id,receiver_id,content,created_at) VALUES (?,?,?,?,?,?) RETURNING {MESSAGE_COLUMNS}"
    ))
        .bind(Uuid::now_v7().to_string())
        .bind(chat_id)
        .bind(user_id)
        .bind(receiver_id)
        .bind(content)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

    let (seq,): (i64,) = sqlx::query_as(
        "INSERT INTO chat_messages (chat_id,seq,message_id) SELECT ?,COALESCE(MAX(seq),0)+1,? FROM chat_messages WHERE chat_id=? RETURNING seq"
    )
        .bind(chat_id)
        .bind(&message.id)
        .bind(chat_id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query("UPDATE chats SET updated_at=MAX(updated_at,?) WHERE id=?")
        .bind(now)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

    advance_last_read(&mut tx, chat_id, user_id, message.created_at, seq).await?;
    tx.commit().await?;

    publish(events, Audience::Users(members), ChatEvent::MessageCreated { message: message.clone() });
    Ok(message)
}

/// Sends to the direct chat with `receiver_id`, starting it if needed.
pub async fn send_direct_message(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    receiver_id: &str,
    content: &str,
) -> AppResult<Message> {
    if content.trim().is_empty() {
        return Err(ChatError::Invalid("Message cannot be empty".to_owned()))?;
    }

    let chat = find_or_create_direct_chat(db_pool, events, user_id, receiver_id).await?;
    send_message(db_pool, events, user_id, &chat.id, content).await
}

pub async fn list_messages(db_pool: &SqlitePool, user_id: &str, chat_id: &str) -> AppResult<Vec<Message>> {
    require_member(db_pool, chat_id, user_id).await?;

    let columns = MESSAGE_COLUMNS
        .split(',')
        .map(|column| format!("m.{column}"))
        .collect::<Vec<_>>()
        .join(",");

    Ok(
        sqlx::query_as(&format!(
            "SELECT {columns} FROM chat_messages cm JOIN messages m ON m.id=cm.message_id WHERE cm.chat_id=? ORDER BY cm.seq"
        ))
            .bind(chat_id)
            .fetch_all(db_pool)
            .await?
    )
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(db_pool): State<SqlitePool>,
    session: Session,
    ApiPath(chat_id): ApiPath<String>,
) -> AppResult<Json<Vec<Message>>> {
    let user_id = require_user(&session).await?;
    Ok(Json(list_messages(&db_pool, &user_id, &chat_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn send(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiPath(chat_id): ApiPath<String>,
    ApiJson(SendMessageQuery { content }): ApiJson<SendMessageQuery>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let user_id = require_user(&session).await?;
    let message = send_message(&db_pool, &events, &user_id, &chat_id, &content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_direct(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiJson(DirectMessageQuery { receiver_id, content }): ApiJson<DirectMessageQuery>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let user_id = require_user(&session).await?;
    let message = send_direct_message(&db_pool, &events, &user_id, &receiver_id, &content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}
