use axum::{routing::get, Router};
use rand::seq::IndexedRandom;
use sqlx::SqlitePool;
use tracing::info;

mod clients;
mod login;
mod lockin;
mod logout;

pub use clients::{ClientProvider, Clients};

use crate::{db::{self, User, USER_COLUMNS}, AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login/{provider}", get(login::login))
        .route("/lockin/{provider}", get(lockin::lockin))
        .route("/logout", get(logout::logout))
}

/// What the identity provider tells us about a fresh sign-in.
#[derive(Debug, Default, Clone)]
pub struct ProviderProfile {
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
}

fn random_alias() -> String {
    let adjectives = [
        "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
        "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
        "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
    ];
    let nouns = [
        "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
        "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
        "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
    ];

    let mut rng = rand::rng();
    format!(
        "{} {}",
        adjectives.choose(&mut rng).copied().unwrap_or("Quiet"),
        nouns.choose(&mut rng).copied().unwrap_or("Stranger"),
    )
}

/// Returns the user record for `user_id`, creating it on first sign-in.
/// Concurrent first sign-ins all get the one row that won the insert.
pub async fn ensure_user(db_pool: &SqlitePool, user_id: &str, profile: ProviderProfile) -> AppResult<User> {
    let name = profile.name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(random_alias);

    let inserted = sqlx::query(
        "INSERT INTO users (id,name,email,image,status,last_seen) VALUES (?,?,?,?,'online',?) ON CONFLICT (id) DO NOTHING"
    )
        .bind(user_id)
        .bind(&name)
        .bind(profile.email)
        .bind(profile.image)
        .bind(db::now_ms())
        .execute(db_pool)
        .await?
        .rows_affected();
    if inserted > 0 {
        info!(%user_id, %name, "added user");
    }

    Ok(
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id=?"))
            .bind(user_id)
            .fetch_one(db_pool)
            .await?
    )
}
