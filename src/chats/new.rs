use axum::{debug_handler, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tower_sessions::Session;
use tracing::info;
use uuid::Uuid;

use crate::{
    db::{self, Chat, ChatType, UserId, CHAT_COLUMNS},
    events::{publish, Audience, ChatEvent, Envelope},
    session::require_user,
    ApiJson, AppResult, AppState, ChatError,
};

use super::list::{get_chat, ChatDetail};

#[derive(Debug, Deserialize)]
pub struct NewChatRequest {
    pub name: String,
    /// Members besides the caller, who is always added.
    #[serde(default)]
    pub users: Vec<UserId>,
    pub chat_type: ChatType,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DirectChatRequest {
    user_id: UserId,
}

async fn insert_chat(conn: &mut SqliteConnection, name: &str, chat_type: ChatType, members: &[UserId]) -> AppResult<Chat> {
    let now = db::now_ms();
    let chat: Chat = sqlx::query_as(&format!(
        "INSERT INTO chats (id,name,chat_type,created_at,updated_at) VALUES (?,?,?,?,?) RETURNING {CHAT_COLUMNS}"
    ))
        .bind(Uuid::now_v7().to_string())
        .bind(name)
        .bind(chat_type)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

    for user_id in members {
        sqlx::query("INSERT INTO chat_members (chat_id,user_id) VALUES (?,?)")
            .bind(&chat.id)
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(chat)
}

async fn user_name(conn: &mut SqliteConnection, user_id: &str) -> AppResult<String> {
    let (name,): (String,) = sqlx::query_as("SELECT name FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(ChatError::NotFound("User"))?;
    Ok(name)
}

pub async fn create_chat(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    NewChatRequest { name, users, chat_type }: NewChatRequest,
) -> AppResult<Chat> {
    let mut members: Vec<UserId> = vec![user_id.to_owned()];
    for member in users {
        if !members.contains(&member) {
            members.push(member);
        }
    }

    let name = name.trim();
    match chat_type {
        ChatType::Direct if members.len() != 2 => {
            return Err(ChatError::Invalid("A direct chat needs exactly two distinct users".to_owned()))?;
        }
        ChatType::Group if name.is_empty() => {
            return Err(ChatError::Invalid("Chat name cannot be empty".to_owned()))?;
        }
        _ => {}
    }

    let mut tx = db::begin_write(db_pool).await?;
    for member in &members {
        user_name(&mut tx, member).await?;
    }
    let chat = insert_chat(&mut tx, name, chat_type, &members).await?;
    tx.commit().await?;

    info!(chat_id = %chat.id, ?chat_type, members = members.len(), "chat created");
    publish(events, Audience::Users(members.clone()), ChatEvent::ChatCreated { chat: chat.clone(), members });
    Ok(chat)
}

/// The direct chat between `user_id` and `other_id`, created with both
/// memberships if there is none yet.
pub async fn find_or_create_direct_chat(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    other_id: &str,
) -> AppResult<Chat> {
    if user_id == other_id {
        return Err(ChatError::Invalid("Cannot start a direct chat with yourself".to_owned()))?;
    }

    // the write lock serializes concurrent lookups for the same pair, so the
    // second caller finds the chat the first one inserted
    let mut tx = db::begin_write(db_pool).await?;
    let my_name = user_name(&mut tx, user_id).await?;
    let other_name = user_name(&mut tx, other_id).await?;

    let mine: Vec<(String,)> = sqlx::query_as("SELECT chat_id FROM chat_members WHERE user_id=? ORDER BY rowid")
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
    let theirs: Vec<(String,)> = sqlx::query_as("SELECT chat_id FROM chat_members WHERE user_id=?")
        .bind(other_id)
        .fetch_all(&mut *tx)
        .await?;

    for (chat_id,) in mine.iter().filter(|chat_id| theirs.contains(*chat_id)) {
        let existing: Option<Chat> = sqlx::query_as(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE id=? AND chat_type='direct'"
        ))
            .bind(chat_id)
            .fetch_optional(&mut *tx)
            .await?;
        if let Some(chat) = existing {
            return Ok(chat);
        }
    }

    let members = vec![user_id.to_owned(), other_id.to_owned()];
    let chat = insert_chat(&mut tx, &format!("{my_name}, {other_name}"), ChatType::Direct, &members).await?;
    tx.commit().await?;

    info!(chat_id = %chat.id, %user_id, %other_id, "direct chat created");
    publish(events, Audience::Users(members.clone()), ChatEvent::ChatCreated { chat: chat.clone(), members });
    Ok(chat)
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_chat(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiJson(request): ApiJson<NewChatRequest>,
) -> AppResult<(StatusCode, Json<ChatDetail>)> {
    let user_id = require_user(&session).await?;
    let chat = create_chat(&db_pool, &events, &user_id, request).await?;
    Ok((StatusCode::CREATED, Json(get_chat(&db_pool, &user_id, &chat.id).await?)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn direct_chat(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiJson(DirectChatRequest { user_id: other_id }): ApiJson<DirectChatRequest>,
) -> AppResult<Json<ChatDetail>> {
    let user_id = require_user(&session).await?;
    let chat = find_or_create_direct_chat(&db_pool, &events, &user_id, &other_id).await?;
    Ok(Json(get_chat(&db_pool, &user_id, &chat.id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chats::members_of, db::testing};

    #[tokio::test]
    async fn direct_chat_is_reused() {
        let db_pool = testing::pool().await;
        let (events, mut rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;
        testing::user(&db_pool, "bob", "Bob").await;

        let first = find_or_create_direct_chat(&db_pool, &events, "alice", "bob").await.unwrap();
        assert_eq!(first.chat_type, ChatType::Direct);
        assert_eq!(first.name, "Alice, Bob");
        assert_eq!(members_of(&db_pool, &first.id).await.unwrap(), ["alice", "bob"]);

        let envelope = rx.try_recv().unwrap();
        assert!(envelope.is_for("alice") && envelope.is_for("bob"));

        let again = find_or_create_direct_chat(&db_pool, &events, "alice", "bob").await.unwrap();
        let reversed = find_or_create_direct_chat(&db_pool, &events, "bob", "alice").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(reversed.id, first.id);
        // nothing new to announce
        assert!(rx.try_recv().is_err());

        let (chats,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats").fetch_one(&db_pool).await.unwrap();
        assert_eq!(chats, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_contact_shares_one_chat() {
        let (_dir, db_pool) = testing::file_pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;
        testing::user(&db_pool, "bob", "Bob").await;

        let mut tasks = Vec::new();
        for i in 0..8 {
            let (db_pool, events) = (db_pool.clone(), events.clone());
            let (me, other) = if i % 2 == 0 { ("alice", "bob") } else { ("bob", "alice") };
            tasks.push(tokio::spawn(async move {
                find_or_create_direct_chat(&db_pool, &events, me, other).await
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let (chats,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats").fetch_one(&db_pool).await.unwrap();
        assert_eq!(chats, 1);
    }

    #[tokio::test]
    async fn group_with_same_pair_is_not_a_direct_chat() {
        let db_pool = testing::pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;
        testing::user(&db_pool, "bob", "Bob").await;

        let group = create_chat(&db_pool, &events, "alice", NewChatRequest {
            name: "pair".to_owned(),
            users: vec!["bob".to_owned()],
            chat_type: ChatType::Group,
        }).await.unwrap();

        let direct = find_or_create_direct_chat(&db_pool, &events, "alice", "bob").await.unwrap();
        assert_ne!(direct.id, group.id);
        assert_eq!(direct.chat_type, ChatType::Direct);
    }

    #[tokio::test]
    async fn direct_chat_rejects_bad_partners() {
        let db_pool = testing::pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;

        let err = find_or_create_direct_chat(&db_pool, &events, "alice", "alice").await.unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::Invalid(_))));

        let err = find_or_create_direct_chat(&db_pool, &events, "alice", "ghost").await.unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::NotFound("User"))));

        let (chats,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats").fetch_one(&db_pool).await.unwrap();
        assert_eq!(chats, 0);
    }

    #[tokio::test]
    async fn create_chat_adds_caller_once() {
        let db_pool = testing::pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;
        testing::user(&db_pool, "bob", "Bob").await;
        testing::user(&db_pool, "carol", "Carol").await;

        let chat = create_chat(&db_pool, &events, "alice", NewChatRequest {
            name: " crew ".to_owned(),
            users: vec!["bob".to_owned(), "alice".to_owned(), "carol".to_owned(), "bob".to_owned()],
            chat_type: ChatType::Group,
        }).await.unwrap();
        assert_eq!(chat.name, "crew");
        assert_eq!(members_of(&db_pool, &chat.id).await.unwrap(), ["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn create_chat_validates() {
        let db_pool = testing::pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "alice", "Alice").await;
        testing::user(&db_pool, "bob", "Bob").await;
        testing::user(&db_pool, "carol", "Carol").await;

        let direct_of_three = create_chat(&db_pool, &events, "alice", NewChatRequest {
            name: String::new(),
            users: vec!["bob".to_owned(), "carol".to_owned()],
            chat_type: ChatType::Direct,
        }).await.unwrap_err();
        assert!(matches!(direct_of_three.chat_error(), Some(ChatError::Invalid(_))));

        let unnamed_group = create_chat(&db_pool, &events, "alice", NewChatRequest {
            name: "  ".to_owned(),
            users: vec!["bob".to_owned()],
            chat_type: ChatType::Group,
        }).await.unwrap_err();
        assert!(matches!(unnamed_group.chat_error(), Some(ChatError::Invalid(_))));

        let unknown_member = create_chat(&db_pool, &events, "alice", NewChatRequest {
            name: "crew".to_owned(),
            users: vec!["ghost".to_owned()],
            chat_type: ChatType::Group,
        }).await.unwrap_err();
        assert!(matches!(unknown_member.chat_error(), Some(ChatError::NotFound("User"))));

        let (chats,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chats").fetch_one(&db_pool).await.unwrap();
        assert_eq!(chats, 0);
    }
}
