mod profile;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use profile::{get_me, get_users, heartbeat, update_profile, ProfilePatch};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/users", get(profile::users))
        .route("/api/users/me", get(profile::me).patch(profile::edit_me))
        .route("/api/users/me/heartbeat", post(profile::beat))
}
