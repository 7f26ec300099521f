use axum::{debug_handler, extract::{Query, State}, response::{IntoResponse, Redirect}};
use oauth2::{AuthorizationCode, CsrfToken, PkceCodeVerifier, TokenResponse};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_sessions::Session;
use tracing::info;

use crate::{session::{local_return_url, CSRF_STATE, PKCE_VERIFIER, RETURN_URL, USER_ID}, ApiPath, AppResult, AppState, ChatError, GetField};

use super::{clients::ClientProvider, ensure_user, Clients, ProviderProfile};

#[derive(Deserialize)]
pub struct LockinQuery {
    pub state: Option<String>,
    pub code: Option<String>,
}

#[derive(Serialize)]
struct FirebaseRequest {
    post_body: String,
    request_uri: String,
    return_idp_credential: bool,
    return_secure_token: bool,
}

fn optional_str(body: &serde_json::Value, field: &str) -> Option<String> {
    body.get(field).and_then(|v| v.as_str()).map(str::to_owned)
}

#[debug_handler(state = AppState)]
pub(crate) async fn lockin(
    ApiPath(provider): ApiPath<ClientProvider>,
    Query(LockinQuery { state, code }): Query<LockinQuery>,
    State(db_pool): State<SqlitePool>,
    State(clients): State<Clients>,
    session: Session,
) -> AppResult<impl IntoResponse> {
    let invalid = |msg: &str| ChatError::Invalid(format!("OAuth: {msg}"));

    let state = CsrfToken::new(state.ok_or(invalid("without state"))?);
    let code = AuthorizationCode::new(code.ok_or(invalid("without code"))?);

    let Some(stored_state) = session.remove::<String>(CSRF_STATE).await? else {
        return Err(invalid("no csrf_state"))?;
    };

    if state.secret().as_str() != stored_state.as_str() {
        return Err(invalid("csrf tokens don't match"))?;
    }

    let Some(pkce_verifier) = session.remove::<String>(PKCE_VERIFIER).await? else {
        return Err(invalid("no pkce_verifier"))?;
    };

    let client = clients.get_client(provider)?;
    let http_client = reqwest::ClientBuilder::new()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let token_result = client
        .exchange_code(code)
        .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier))
        .request_async(&http_client)
        .await?;

    let access_token = token_result.access_token().secret();
    let body: serde_json::Value = http_client.post(clients.firebase_idpurl)
        .json(&FirebaseRequest {
            post_body: format!("access_token={access_token}&providerId={}", provider.id()),
            request_uri: "http://localhost/".to_owned(),
            return_idp_credential: true,
            return_secure_token: true,
        })
        .send()
        .await?
        .json()
        .await?;

    let user_id = body.get_str_field("localId")?;
    let user = ensure_user(&db_pool, &user_id, ProviderProfile {
        name: optional_str(&body, "displayName"),
        email: optional_str(&body, "email"),
        image: optional_str(&body, "photoUrl"),
    }).await?;

    session.cycle_id().await?;
    session.insert(USER_ID, user_id.clone()).await?;

    info!(%user_id, name = %user.name, %provider, "signed in");

    let return_url = local_return_url(session.remove(RETURN_URL).await?);
    Ok(Redirect::to(&return_url))
}
