use std::fmt;

use oauth2::{basic::BasicClient, AuthUrl, Client, ClientId, ClientSecret, RedirectUrl, TokenUrl};
use serde::Deserialize;
use serde_json::Value;

use crate::{AppResult, ChatError, GetField};

type HappyClient = Client<oauth2::StandardErrorResponse<oauth2::basic::BasicErrorResponseType>, oauth2::StandardTokenResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardTokenIntrospectionResponse<oauth2::EmptyExtraTokenFields, oauth2::basic::BasicTokenType>, oauth2::StandardRevocableToken, oauth2::StandardErrorResponse<oauth2::RevocationErrorResponseType>, oauth2::EndpointSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointNotSet, oauth2::EndpointSet>;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClientProvider {
    Google,
    Github,
}

impl ClientProvider {
    /// Provider id as the identity toolkit knows it.
    pub fn id(&self) -> &str {
        use ClientProvider::*;
        match self {
            Google => "google.com",
            Github => "github.com",
        }
    }

    fn path(&self) -> &str {
        use ClientProvider::*;
        match self {
            Google => "google",
            Github => "github",
        }
    }

    fn endpoints(&self) -> (&'static str, &'static str) {
        use ClientProvider::*;
        match self {
            Google => ("https://accounts.google.com/o/oauth2/auth", "https://oauth2.googleapis.com/token"),
            Github => ("https://github.com/login/oauth/authorize", "https://github.com/login/oauth/access_token"),
        }
    }
}

impl fmt::Display for ClientProvider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OAuth clients per provider plus the identity toolkit endpoint that turns a
/// provider access token into our stable user id.
///
/// ```json
/// { "firebase": { "apikey": "..." },
///   "google": { "client_id": "...", "client_secret": "..." },
///   "github": { "client_id": "...", "client_secret": "..." } }
/// ```
/// Providers without keys are simply unavailable.
#[derive(Clone)]
pub struct Clients {
    pub(crate) firebase_idpurl: String,
    google_client: Option<HappyClient>,
    github_client: Option<HappyClient>,
}

impl Clients {
    pub fn from_json(json: Value, public_url: &str) -> AppResult<Clients> {
        let firebase_idpurl = format!(
            "https://identitytoolkit.googleapis.com/v1/accounts:signInWithIdp?key={}",
            json.get_obj_field("firebase")?.get_str_field("apikey")?
        );

        let build = |provider: ClientProvider| -> AppResult<Option<HappyClient>> {
            let Some(json) = json.get(provider.path()) else {
                return Ok(None);
            };
            let client_id = ClientId::new(json.get_str_field("client_id")?);
            let client_secret = ClientSecret::new(json.get_str_field("client_secret")?);

            let (auth_url, token_url) = provider.endpoints();
            let auth_url = AuthUrl::new(auth_url.to_owned())?;
            let token_url = TokenUrl::new(token_url.to_owned())?;
            let redirect_url = RedirectUrl::new(format!("{public_url}/lockin/{}", provider.path()))?;

            Ok(Some(
                BasicClient::new(client_id)
                .set_client_secret(client_secret)
                .set_auth_uri(auth_url)
                .set_token_uri(token_url)
                .set_redirect_uri(redirect_url)
            ))
        };

        Ok(
            Clients {
                google_client: build(ClientProvider::Google)?,
                github_client: build(ClientProvider::Github)?,
                firebase_idpurl,
            }
        )
    }

    pub fn get_client(&self, provider: ClientProvider) -> AppResult<HappyClient> {
        use ClientProvider::*;
        Ok(match provider {
            Google => self.google_client.clone(),
            Github => self.github_client.clone(),
        }.ok_or(ChatError::Invalid(format!("OAuth provider {provider} keys not supplied")))?)
    }
}
