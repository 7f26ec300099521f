use std::collections::BTreeMap;

use axum::{debug_handler, extract::{Query, State}, Json};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_sessions::Session;

use crate::{db::{Chat, ChatType, UserId}, session::require_user, ApiPath, AppResult, AppState};

use super::{members_of, read::count_unread, require_member};

/// A row of the caller's chat list.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    #[serde(flatten)]
    pub chat: Chat,
    pub members: Vec<UserId>,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatDetail {
    #[serde(flatten)]
    pub chat: Chat,
    pub members: Vec<UserId>,
    /// Message ids in send order.
    pub messages: Vec<String>,
    pub last_read_by: BTreeMap<UserId, i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatsQuery {
    chat_type: Option<ChatType>,
}

/// Chats `user_id` belongs to, most recently active first.
pub async fn get_chats_for_user(db_pool: &SqlitePool, user_id: &str, chat_type: Option<ChatType>) -> AppResult<Vec<ChatSummary>> {
    let chats: Vec<Chat> = sqlx::query_as(
        "SELECT c.id,c.name,c.chat_type,c.created_at,c.updated_at
        FROM chats c JOIN chat_members m ON m.chat_id=c.id
        WHERE m.user_id=? AND (? IS NULL OR c.chat_type=?)
        ORDER BY c.updated_at DESC, c.id DESC"
    )
        .bind(user_id)
        .bind(chat_type)
        .bind(chat_type)
        .fetch_all(db_pool)
        .await?;

    let mut summaries = Vec::with_capacity(chats.len());
    for chat in chats {
        summaries.push(ChatSummary {
            members: members_of(db_pool, &chat.id).await?,
            unread_count: count_unread(db_pool, &chat.id, user_id).await?,
            chat,
        });
    }
    Ok(summaries)
}

pub async fn get_chat(db_pool: &SqlitePool, user_id: &str, chat_id: &str) -> AppResult<ChatDetail> {
    let chat = require_member(db_pool, chat_id, user_id).await?;

    let messages: Vec<(String,)> = sqlx::query_as("SELECT message_id FROM chat_messages WHERE chat_id=? ORDER BY seq")
        .bind(chat_id)
        .fetch_all(db_pool)
        .await?;

    let last_read_by: Vec<(UserId, i64)> = sqlx::query_as("SELECT user_id,last_read_at FROM chat_reads WHERE chat_id=?")
        .bind(chat_id)
        .fetch_all(db_pool)
        .await?;

    Ok(ChatDetail {
        members: members_of(db_pool, chat_id).await?,
        messages: messages.into_iter().map(|(id,)| id).collect(),
        last_read_by: last_read_by.into_iter().collect(),
        chat,
    })
}

#[debug_handler(state = AppState)]
pub(crate) async fn chats(
    State(db_pool): State<SqlitePool>,
    session: Session,
    Query(ChatsQuery { chat_type }): Query<ChatsQuery>,
) -> AppResult<Json<Vec<ChatSummary>>> {
    let user_id = require_user(&session).await?;
    Ok(Json(get_chats_for_user(&db_pool, &user_id, chat_type).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn chat(
    State(db_pool): State<SqlitePool>,
    session: Session,
    ApiPath(chat_id): ApiPath<String>,
) -> AppResult<Json<ChatDetail>> {
    let user_id = require_user(&session).await?;
    Ok(Json(get_chat(&db_pool, &user_id, &chat_id).await?))
}
