//! SSO bearer token cache
//!
//! Exchanges the long-lived refresh token for an access token and keeps it
//! until it expires. Concurrent callers share one refresh.

use reqwest::header::USER_AGENT;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::esi_error::FetchError;
use super::secrets::{SecretError, SecretSource};

pub const CLIENT_ID_SECRET: &str = "ssoClientId";
pub const CLIENT_SECRET_SECRET: &str = "ssoClientSecret";
pub const REFRESH_TOKEN_SECRET: &str = "ssoRefreshToken";

#[derive(Clone)]
pub struct SsoCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl SsoCredentials {
    pub fn from_secrets(secrets: &dyn SecretSource) -> Result<Self, SecretError> {
        Ok(Self {
            client_id: secrets.get(CLIENT_ID_SECRET)?,
            client_secret: secrets.get(CLIENT_SECRET_SECRET)?,
            refresh_token: secrets.get(REFRESH_TOKEN_SECRET)?,
        })
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    token_type: String,
    expires_in: i64,
    refresh_token: String,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

pub struct SsoTokenCache {
    login_url: String,
    user_agent: String,
    credentials: SsoCredentials,
    cached: Mutex<Option<CachedToken>>,
}

impl SsoTokenCache {
    pub fn new(login_url: impl Into<String>, user_agent: impl Into<String>, credentials: SsoCredentials) -> Self {
        Self {
            login_url: login_url.into(),
            user_agent: user_agent.into(),
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Current access token, refreshed first if the cached one expired
    pub async fn bearer(&self, http: &reqwest::Client, cancel: &CancellationToken) -> Result<String, FetchError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.expires_at {
                return Ok(token.access_token.clone());
            }
        }

        let token = tokio::select! {
            token = self.refresh(http) => token?,
            () = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        let access_token = token.access_token.clone();
        *cached = Some(token);
        Ok(access_token)
    }

    async fn refresh(&self, http: &reqwest::Client) -> Result<CachedToken, FetchError> {
        let requested_at = Instant::now();
        let response = http
            .post(&self.login_url)
            .header(USER_AGENT, &self.user_agent)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.credentials.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(FetchError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Auth(format!("token endpoint answered {status}")));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Auth(format!("undecodable token response: {e}")))?;

        if body.token_type != "Bearer" {
            return Err(FetchError::Auth(format!("unexpected token type {:?}", body.token_type)));
        }
        if body.refresh_token != self.credentials.refresh_token {
            return Err(FetchError::Auth("refresh token was rotated by the server".to_string()));
        }
        let lifetime = u64::try_from(body.expires_in)
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or_else(|| FetchError::Auth(format!("token expires in {}s", body.expires_in)))?;

        info!("🔑 SSO access token refreshed, valid for {}s", lifetime);
        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: requested_at + Duration::from_secs(lifetime),
        })
    }
}
