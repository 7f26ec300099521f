use tower_sessions::Session;

use crate::{db::UserId, AppResult, ChatError};

pub const USER_ID: &str = "user_id";
pub const CSRF_STATE: &str = "csrf_state";
pub const PKCE_VERIFIER: &str = "pkce_verifier";
pub const RETURN_URL: &str = "return_url";

/// The signed-in user's id, or `NotAuthenticated`.
pub async fn require_user(session: &Session) -> AppResult<UserId> {
    Ok(session.get::<UserId>(USER_ID).await?.ok_or(ChatError::NotAuthenticated)?)
}

/// Where to send the browser after sign-in or sign-out. Only paths on this
/// site are honored; anything else, including `//host` and `/\host`, goes to `/`.
pub fn local_return_url(return_url: Option<String>) -> String {
    match return_url {
        Some(url) if url.starts_with('/') && !url.starts_with("//") && !url.contains('\\') => url,
        _ => "/".to_owned(),
    }
}
