use anyhow::Context;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Method};
use clonecord::{auth, config::Config, db, AppState};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clonecord=info")),
        )
        .init();

    let config = Config::from_env()?;

    let db_pool = db::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let client_secrets = std::fs::read_to_string(&config.client_secrets)
        .with_context(|| format!("reading {}", config.client_secrets.display()))?;
    let clients = auth::Clients::from_json(serde_json::from_str(&client_secrets)?, &config.public_url)
        .map_err(|err| err.0)?;

    let app_state = AppState {
        db_pool,
        clients,
        events: broadcast::channel(256).0,
    };

    let mut app = clonecord::app(app_state, config.session_inactivity);
    if let Some(origin) = &config.allowed_origin {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin.parse::<HeaderValue>()?)
                .allow_credentials(true)
                .allow_methods([Method::GET, Method::POST, Method::PATCH])
                .allow_headers([CONTENT_TYPE]),
        );
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
