use axum::{body::Bytes, debug_handler, extract::State, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tower_sessions::Session;

use crate::{
    db::{self, User, UserStatus, USER_COLUMNS},
    events::{publish, Audience, ChatEvent, Envelope},
    session::require_user,
    ApiJson, AppResult, AppState, ChatError,
};

/// Fields a user may change about themselves. Absent fields stay as they are.
#[derive(Debug, Default, Deserialize)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub bio: Option<String>,
    pub custom_status: Option<String>,
    pub image: Option<String>,
    pub status: Option<UserStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HeartbeatRequest {
    #[serde(default)]
    status: Option<UserStatus>,
}

impl HeartbeatRequest {
    /// A heartbeat may come with no body at all.
    fn from_body(body: &[u8]) -> AppResult<Self> {
        if body.trim_ascii().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(|err| ChatError::Invalid(format!("Invalid heartbeat: {err}")).into())
    }
}

pub async fn get_users(db_pool: &SqlitePool) -> AppResult<Vec<User>> {
    Ok(
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY name COLLATE NOCASE, id"))
            .fetch_all(db_pool)
            .await?
    )
}

pub async fn get_me(db_pool: &SqlitePool, user_id: &str) -> AppResult<User> {
    Ok(
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id=?"))
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?
            .ok_or(ChatError::NotFound("User"))?
    )
}

pub async fn update_profile(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    ProfilePatch { name, bio, custom_status, image, status }: ProfilePatch,
) -> AppResult<User> {
    let name = name.map(|name| name.trim().to_owned());
    if name.as_deref() == Some("") {
        return Err(ChatError::Invalid("Name cannot be empty".to_owned()))?;
    }

    let user: User = sqlx::query_as(&format!(
        "UPDATE users SET
            name=COALESCE(?,name),
            bio=COALESCE(?,bio),
            custom_status=COALESCE(?,custom_status),
            image=COALESCE(?,image),
            status=COALESCE(?,status)
        WHERE id=? RETURNING {USER_COLUMNS}"
    ))
        .bind(name)
        .bind(bio)
        .bind(custom_status)
        .bind(image)
        .bind(status)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .ok_or(ChatError::NotFound("User"))?;

    publish(events, Audience::Everyone, ChatEvent::UserUpdated { user: user.clone() });
    Ok(user)
}

/// Marks the user as seen now, `online` unless told otherwise.
pub async fn heartbeat(
    db_pool: &SqlitePool,
    events: &broadcast::Sender<Envelope>,
    user_id: &str,
    status: Option<UserStatus>,
) -> AppResult<User> {
    let status = status.unwrap_or(UserStatus::Online);

    let (previous,): (UserStatus,) = sqlx::query_as("SELECT status FROM users WHERE id=?")
        .bind(user_id)
        .fetch_optional(db_pool)
        .await?
        .ok_or(ChatError::NotFound("User"))?;

    let user: User = sqlx::query_as(&format!(
        "UPDATE users SET status=?, last_seen=MAX(COALESCE(last_seen,0),?) WHERE id=? RETURNING {USER_COLUMNS}"
    ))
        .bind(status)
        .bind(db::now_ms())
        .bind(user_id)
        .fetch_one(db_pool)
        .await?;

    // last_seen alone changes every beat; only status changes are news
    if previous != status {
        publish(events, Audience::Everyone, ChatEvent::UserUpdated { user: user.clone() });
    }
    Ok(user)
}

#[debug_handler(state = AppState)]
pub(crate) async fn users(
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<Json<Vec<User>>> {
    require_user(&session).await?;
    Ok(Json(get_users(&db_pool).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn me(
    State(db_pool): State<SqlitePool>,
    session: Session,
) -> AppResult<Json<User>> {
    let user_id = require_user(&session).await?;
    Ok(Json(get_me(&db_pool, &user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn edit_me(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    ApiJson(patch): ApiJson<ProfilePatch>,
) -> AppResult<Json<User>> {
    let user_id = require_user(&session).await?;
    Ok(Json(update_profile(&db_pool, &events, &user_id, patch).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn beat(
    State(db_pool): State<SqlitePool>,
    State(events): State<broadcast::Sender<Envelope>>,
    session: Session,
    body: Bytes,
) -> AppResult<Json<User>> {
    let user_id = require_user(&session).await?;
    let HeartbeatRequest { status } = HeartbeatRequest::from_body(&body)?;
    Ok(Json(heartbeat(&db_pool, &events, &user_id, status).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing;

    #[tokio::test]
    async fn lists_users_by_name() {
        let db_pool = testing::pool().await;
        testing::user(&db_pool, "u2", "bob").await;
        testing::user(&db_pool, "u1", "Alice").await;

        let names: Vec<String> = get_users(&db_pool).await.unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, ["Alice", "bob"]);
    }

    #[tokio::test]
    async fn me_requires_a_record() {
        let db_pool = testing::pool().await;
        testing::user(&db_pool, "u1", "Alice").await;

        assert_eq!(get_me(&db_pool, "u1").await.unwrap().name, "Alice");

        let err = get_me(&db_pool, "ghost").await.unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::NotFound("User"))));
        assert_eq!(err.0.to_string(), "User not found");
    }

    #[tokio::test]
    async fn patch_keeps_absent_fields() {
        let db_pool = testing::pool().await;
        let (events, mut rx) = testing::events();
        testing::user(&db_pool, "u1", "Alice").await;

        let user = update_profile(&db_pool, &events, "u1", ProfilePatch {
            bio: Some("hi".to_owned()),
            status: Some(UserStatus::Busy),
            ..Default::default()
        }).await.unwrap();
        assert_eq!(user.name, "Alice");
        assert_eq!(user.bio.as_deref(), Some("hi"));
        assert_eq!(user.status, UserStatus::Busy);

        let user = update_profile(&db_pool, &events, "u1", ProfilePatch {
            name: Some("  Alicia ".to_owned()),
            ..Default::default()
        }).await.unwrap();
        assert_eq!(user.name, "Alicia");
        assert_eq!(user.bio.as_deref(), Some("hi"));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.audience, Audience::Everyone);
        assert!(matches!(envelope.event, ChatEvent::UserUpdated { .. }));
    }

    #[tokio::test]
    async fn blank_name_rejected() {
        let db_pool = testing::pool().await;
        let (events, _rx) = testing::events();
        testing::user(&db_pool, "u1", "Alice").await;

        let err = update_profile(&db_pool, &events, "u1", ProfilePatch {
            name: Some(" ".to_owned()),
            ..Default::default()
        }).await.unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::Invalid(_))));
        assert_eq!(get_me(&db_pool, "u1").await.unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn heartbeat_sets_presence() {
        let db_pool = testing::pool().await;
        let (events, mut rx) = testing::events();
        let before = testing::user(&db_pool, "u1", "Alice").await;

        let user = heartbeat(&db_pool, &events, "u1", None).await.unwrap();
        assert_eq!(user.status, UserStatus::Online);
        assert!(user.last_seen >= before.last_seen);
        // already online, nothing to announce
        assert!(rx.try_recv().is_err());

        let user = heartbeat(&db_pool, &events, "u1", Some(UserStatus::Away)).await.unwrap();
        assert_eq!(user.status, UserStatus::Away);
        assert!(rx.try_recv().is_ok());

        let err = heartbeat(&db_pool, &events, "ghost", None).await.unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::NotFound(_))));
    }

    #[test]
    fn heartbeat_body_is_optional() {
        assert_eq!(HeartbeatRequest::from_body(b"").unwrap().status, None);
        assert_eq!(HeartbeatRequest::from_body(b" \n").unwrap().status, None);
        assert_eq!(HeartbeatRequest::from_body(b"{}").unwrap().status, None);
        assert_eq!(HeartbeatRequest::from_body(br#"{"status":"busy"}"#).unwrap().status, Some(UserStatus::Busy));

        let err = HeartbeatRequest::from_body(br#"{"status":"asleep"}"#).unwrap_err();
        assert!(matches!(err.chat_error(), Some(ChatError::Invalid(_))));
    }
}
