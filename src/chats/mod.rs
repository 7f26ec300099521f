mod list;
mod msg;
mod new;
mod read;
mod ws;

use axum::{routing::{get, post}, Router};
use sqlx::SqlitePool;

use crate::{db::{Chat, ChatMember, UserId, CHAT_COLUMNS}, AppResult, AppState, ChatError};

pub use list::{get_chat, get_chats_for_user, ChatDetail, ChatSummary};
pub use msg::{list_messages, send_direct_message, send_message};
pub use new::{create_chat, find_or_create_direct_chat, NewChatRequest};
pub use read::{mark_read, unread_count};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/chats", get(list::chats).post(new::new_chat))
        .route("/api/chats/direct", post(new::direct_chat))
        .route("/api/chats/{uuid}", get(list::chat))
        .route("/api/chats/{uuid}/messages", get(msg::messages).post(msg::send))
        .route("/api/chats/{uuid}/read", post(read::read))
        .route("/api/chats/{uuid}/unread", get(read::unread))
        .route("/api/messages", post(msg::send_direct))
        .route("/api/ws", get(ws::chat_ws))
}

/// The chat, if `user_id` is one of its members. Non-members get the same
/// answer as for a chat that does not exist.
pub(crate) async fn require_member(db_pool: &SqlitePool, chat_id: &str, user_id: &str) -> AppResult<Chat> {
    Ok(
        sqlx::query_as(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id=? AND EXISTS (SELECT 1 FROM chat_members WHERE chat_id=chats.id AND user_id=?)"
        ))
            .bind(chat_id)
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?
            .ok_or(ChatError::NotFound("Chat"))?
    )
}

pub(crate) async fn members_of(db_pool: &SqlitePool, chat_id: &str) -> AppResult<Vec<UserId>> {
    let members: Vec<ChatMember> = sqlx::query_as("SELECT chat_id,user_id FROM chat_members WHERE chat_id=? ORDER BY rowid")
        .bind(chat_id)
        .fetch_all(db_pool)
        .await?;
    Ok(members.into_iter().map(|member| member.user_id).collect())
}
