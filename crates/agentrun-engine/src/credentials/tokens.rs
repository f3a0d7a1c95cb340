//! Access-token acquisition for OAuth credentials.
//!
//! - antigravity: the stored access token is reused while it has more than a
//!   minute left; otherwise the refresh token is exchanged at the Google token
//!   endpoint and the new access token is persisted encrypted.
//! - copilot: the stored GitHub token is exchanged for a short-lived Copilot
//!   token. Exchanged tokens are cached in memory under the SHA-256 of the
//!   source token and exchanged again only when within five minutes of expiry.

use std::collections::HashMap;
use std::sync::Arc;

use agentrun_core::{Credential, OAuthProvider};
use agentrun_protocol::ProtocolError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Endpoints;
use crate::error::EngineError;
use crate::ports::{Cipher, CredentialStore};
use crate::USER_AGENT;

/// Minimum remaining validity for reusing a stored access token.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Minimum remaining validity for reusing an exchanged token.
const EXCHANGE_MARGIN_SECS: i64 = 5 * 60;

/// Assumed lifetime when a token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3_600;

#[derive(Debug, Deserialize)]
struct RefreshReply {
    access_token: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExchangeReply {
    token: Option<String>,
    /// Unix seconds.
    expires_at: Option<i64>,
}

struct ExchangedToken {
    token: SecretString,
    expires_at: DateTime<Utc>,
}

/// Produces a usable bearer token for one attempt.
pub struct TokenBroker {
    http: reqwest::Client,
    cipher: Arc<dyn Cipher>,
    store: Arc<dyn CredentialStore>,
    endpoints: Endpoints,
    exchanged: Mutex<HashMap<String, ExchangedToken>>,
}

impl TokenBroker {
    pub fn new(
        http: reqwest::Client,
        cipher: Arc<dyn Cipher>,
        store: Arc<dyn CredentialStore>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            http,
            cipher,
            store,
            endpoints,
            exchanged: Mutex::new(HashMap::new()),
        }
    }

    /// Bearer token for `credential`, refreshing or exchanging as needed.
    pub async fn access_token(&self, credential: &Credential) -> Result<SecretString, EngineError> {
        match credential.provider {
            OAuthProvider::Antigravity => self.refreshed_token(credential).await,
            OAuthProvider::Copilot => self.exchanged_token(credential).await,
        }
    }

    async fn refreshed_token(&self, credential: &Credential) -> Result<SecretString, EngineError> {
        let now = Utc::now();
        if let (Some(sealed), Some(expires_at)) = (&credential.access_token, credential.expires_at)
        {
            if expires_at > now + Duration::seconds(REFRESH_MARGIN_SECS) {
                return Ok(self.cipher.decrypt(sealed)?);
            }
        }

        let sealed_refresh = credential
            .refresh_token
            .as_ref()
            .ok_or_else(|| EngineError::MissingToken(credential.id.to_string()))?;
        let refresh = self.cipher.decrypt(sealed_refresh)?;

        debug!(credential = %credential.id, "Refreshing access token");
        let response = self
            .http
            .post(&self.endpoints.google_token_url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .form(&[
                ("client_id", self.endpoints.antigravity_client_id.as_str()),
                ("client_secret", self.endpoints.antigravity_client_secret.as_str()),
                ("refresh_token", refresh.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::upstream(status.as_u16(), &body));
        }

        let bytes = response.bytes().await?;
        let reply: RefreshReply = serde_json::from_slice(&bytes).map_err(ProtocolError::from)?;
        let token = reply
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::MissingField("access_token"))?;
        let expires_at = expiry_after(now, reply.expires_in);

        if let Some(mut latest) = self.store.get_credential(&credential.id).await? {
            latest.access_token = Some(self.cipher.encrypt(&token)?);
            latest.expires_at = Some(expires_at);
            if let Some(rotated) = reply.refresh_token.filter(|t| !t.is_empty()) {
                latest.refresh_token = Some(self.cipher.encrypt(&rotated)?);
            }
            self.store.save_credential(&latest).await?;
        }
        info!(credential = %credential.id, expires_at = %expires_at, "Access token refreshed");

        Ok(SecretString::from(token))
    }

    async fn exchanged_token(&self, credential: &Credential) -> Result<SecretString, EngineError> {
        let sealed = credential
            .access_token
            .as_ref()
            .ok_or_else(|| EngineError::MissingToken(credential.id.to_string()))?;
        let source = self.cipher.decrypt(sealed)?;
        let key = cache_key(&source);
        let now = Utc::now();

        if let Some(cached) = self.exchanged.lock().await.get(&key) {
            if cached.expires_at - now > Duration::seconds(EXCHANGE_MARGIN_SECS) {
                return Ok(SecretString::from(cached.token.expose_secret().to_string()));
            }
        }

        debug!(credential = %credential.id, "Exchanging token");
        let response = self
            .http
            .get(&self.endpoints.copilot_token_url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("token {}", source.expose_secret()),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::upstream(status.as_u16(), &body));
        }

        let bytes = response.bytes().await?;
        let reply: ExchangeReply = serde_json::from_slice(&bytes).map_err(ProtocolError::from)?;
        let token = reply
            .token
            .filter(|t| !t.is_empty())
            .ok_or(ProtocolError::MissingField("token"))?;
        let expires_at = reply
            .expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(|| expiry_after(now, None));

        self.exchanged.lock().await.insert(
            key,
            ExchangedToken {
                token: SecretString::from(token.clone()),
                expires_at,
            },
        );
        info!(credential = %credential.id, expires_at = %expires_at, "Token exchanged");

        Ok(SecretString::from(token))
    }
}

/// Expiry `expires_in` seconds after `now`; out-of-range lifetimes fall back to the default.
fn expiry_after(now: DateTime<Utc>, expires_in: Option<i64>) -> DateTime<Utc> {
    let after = |secs| Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d));
    expires_in
        .and_then(after)
        .or_else(|| after(DEFAULT_EXPIRES_IN_SECS))
        .unwrap_or(now)
}

/// Hex SHA-256 of a source token; the token itself is never used as a key.
fn cache_key(source: &SecretString) -> String {
    hex::encode(Sha256::digest(source.expose_secret().as_bytes()))
}
