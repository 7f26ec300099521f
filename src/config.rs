use std::path::PathBuf;

use anyhow::{anyhow, Context};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// OAuth client ids and secrets, see `auth::Clients::from_json`.
    pub client_secrets: PathBuf,
    /// Base url the OAuth providers redirect back to.
    pub public_url: String,
    /// Origin of a separately served UI, if any.
    pub allowed_origin: Option<String>,
    pub session_inactivity: time::Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL must be set")?;

        let session_inactivity = match lookup("SESSION_INACTIVITY_MINUTES") {
            Some(minutes) => {
                let minutes: i64 = minutes
                    .parse()
                    .with_context(|| format!("SESSION_INACTIVITY_MINUTES={minutes} is not a number"))?;
                if minutes <= 0 {
                    return Err(anyhow!("SESSION_INACTIVITY_MINUTES must be positive"));
                }
                time::Duration::minutes(minutes)
            }
            None => time::Duration::minutes(60),
        };

        Ok(Config {
            database_url,
            bind_addr: lookup("BIND_ADDR").unwrap_or("0.0.0.0:8080".to_owned()),
            client_secrets: lookup("CLIENT_SECRETS").unwrap_or("client_secret.json".to_owned()).into(),
            public_url: lookup("PUBLIC_URL")
                .unwrap_or("http://localhost:8080".to_owned())
                .trim_end_matches('/')
                .to_owned(),
            allowed_origin: lookup("ALLOWED_ORIGIN").filter(|origin| !origin.is_empty()),
            session_inactivity,
        })
    }
}
