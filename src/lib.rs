pub mod auth;
pub mod chats;
pub mod config;
pub mod db;
pub mod events;
pub mod session;
pub mod users;

use axum::{
    extract::{rejection::{JsonRejection, PathRejection}, FromRef, FromRequest, FromRequestParts, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use oauth2::reqwest;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer, SessionStore};

use events::Envelope;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub db_pool: SqlitePool,
    pub clients: auth::Clients,
    pub events: broadcast::Sender<Envelope>,
}

/// Builds the full router: auth flow, JSON api and the event feed, behind an
/// in-memory session store.
pub fn app(state: AppState, session_inactivity: time::Duration) -> Router {
    app_with_store(state, MemoryStore::default(), session_inactivity)
}

pub fn app_with_store<Store: SessionStore + Clone>(state: AppState, store: Store, session_inactivity: time::Duration) -> Router {
    let session_layer = SessionManagerLayer::new(store)
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(session_inactivity));

    Router::new()
        .merge(auth::router())
        .merge(users::router())
        .merge(chats::router())
        .with_state(state)
        .layer(session_layer)
}

/// `Json` whose rejections come back as `{ "error": .. }` like every other
/// failure.
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// `Path` with the same error body as `ApiJson`.
#[derive(Debug, FromRequestParts)]
#[from_request(via(Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

pub trait GetField {
    fn get_str_field(&self, field: &str) -> AppResult<String>;
    fn get_obj_field(&self, field: &str) -> AppResult<&Value>;
}

impl GetField for serde_json::Value {
    fn get_str_field(&self, field: &str) -> AppResult<String> {
        Ok(
            self.get(field)
            .ok_or(format!("expected {field} in {self}"))?
            .as_str()
            .ok_or(format!("expected {field} in {self} to be string"))?
            .to_owned()
        )
    }

    fn get_obj_field(&self, field: &str) -> AppResult<&Value> {
        self.get(field)
        .ok_or(format!("expected {field} in {self}").into())
    }
}

/// Failures a caller can act on. The message is what the UI shows.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("User not authenticated")]
    NotAuthenticated,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Invalid(String),
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn chat_error(&self) -> Option<&ChatError> {
        self.0.downcast_ref::<ChatError>()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.chat_error() {
            Some(ChatError::NotAuthenticated) => StatusCode::UNAUTHORIZED,
            Some(ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::Invalid(_)) => StatusCode::BAD_REQUEST,
            None => {
                tracing::error!("{}\n\n{}", self.0, self.0.backtrace());
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self(anyhow::Error::from(ChatError::Invalid(rejection.body_text())))
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        Self(anyhow::Error::from(ChatError::Invalid(rejection.body_text())))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(ChatError);
apperr_impl!(serde_json::Error);
apperr_impl!(sqlx::Error);
apperr_impl!(tower_sessions::session::Error);
apperr_impl!(axum::Error);
apperr_impl!(reqwest::Error);
apperr_impl!(oauth2::url::ParseError);

// generic params don't fit through apperr_impl
impl<E: core::error::Error + Send + Sync + 'static, R: oauth2::ErrorResponse + Send + Sync + 'static> From<oauth2::RequestTokenError<E, R>> for AppError {
    fn from(err: oauth2::RequestTokenError<E, R>) -> Self {
        Self(anyhow::Error::from(err))
    }
}
