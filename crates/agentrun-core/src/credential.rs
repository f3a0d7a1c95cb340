//! Stored provider accounts.
//!
//! Token fields hold ciphertext exactly as persisted. Decryption happens in the
//! engine, for the duration of one attempt only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ApiProviderId, CredentialId};
use crate::provider::{ApiKind, OAuthProvider};
use crate::status::CredentialStatus;

/// Maximum number of characters kept from an attempt's error message.
pub const MAX_ERROR_LEN: usize = 500;

/// An OAuth account usable by one provider family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,

    /// Provider family this account belongs to.
    pub provider: OAuthProvider,

    /// Human-readable account label (e.g. an email).
    #[serde(default)]
    pub label: String,

    /// Encrypted access token.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Encrypted refresh token.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// When the access token stops being valid.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Lower ranks are tried first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub failure_count: u32,

    #[serde(default)]
    pub last_error: Option<String>,

    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub status: CredentialStatus,

    /// Model forced for every run made with this account.
    #[serde(default)]
    pub model_override: Option<String>,
}

impl Credential {
    /// Create an active credential with empty bookkeeping.
    pub fn new(id: impl Into<CredentialId>, provider: OAuthProvider) -> Self {
        Self {
            id: id.into(),
            provider,
            label: String::new(),
            access_token: None,
            refresh_token: None,
            expires_at: None,
            priority: 0,
            failure_count: 0,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            status: CredentialStatus::Active,
            model_override: None,
        }
    }

    /// Builder method to set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Builder method to set the priority rank.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Builder method to set the encrypted access token and its expiry.
    pub fn with_access_token(
        mut self,
        ciphertext: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.access_token = Some(ciphertext.into());
        self.expires_at = expires_at;
        self
    }

    /// Builder method to set the encrypted refresh token.
    pub fn with_refresh_token(mut self, ciphertext: impl Into<String>) -> Self {
        self.refresh_token = Some(ciphertext.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }

    /// Clear failure bookkeeping after a successful attempt.
    pub fn mark_success(&mut self, at: DateTime<Utc>) {
        self.failure_count = 0;
        self.last_error = None;
        self.last_error_at = None;
        self.last_success_at = Some(at);
    }

    /// Record a failed attempt, truncating the message to [`MAX_ERROR_LEN`] chars.
    pub fn mark_failure(&mut self, message: &str, at: DateTime<Utc>) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(message.chars().take(MAX_ERROR_LEN).collect());
        self.last_error_at = Some(at);
    }
}

/// A user-configured HTTP endpoint authenticated by an API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiProvider {
    pub id: ApiProviderId,

    pub name: String,

    /// Wire format used to build requests and decode the stream.
    pub kind: ApiKind,

    /// Base URL without a trailing slash (e.g. `https://api.openai.com/v1`).
    pub base_url: String,

    /// Encrypted API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Models offered by this provider; the first one is the default.
    #[serde(default)]
    pub models: Vec<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ApiProvider {
    /// Pick the caller's model or fall back to the first configured one.
    pub fn resolve_model<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested
            .filter(|m| !m.is_empty())
            .or_else(|| self.models.first().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_failure_truncates_message() {
        let mut cred = Credential::new("c1", OAuthProvider::Copilot);
        let long = "x".repeat(MAX_ERROR_LEN + 100);
        cred.mark_failure(&long, Utc::now());
        cred.mark_failure("again", Utc::now());

        assert_eq!(cred.failure_count, 2);
        assert_eq!(cred.last_error.as_deref(), Some("again"));

        cred.mark_failure(&long, Utc::now());
        assert_eq!(cred.last_error.as_ref().unwrap().chars().count(), MAX_ERROR_LEN);
    }

    #[test]
    fn test_mark_success_clears_errors() {
        let mut cred = Credential::new("c1", OAuthProvider::Antigravity);
        cred.mark_failure("HTTP 401", Utc::now());
        let now = Utc::now();
        cred.mark_success(now);

        assert_eq!(cred.failure_count, 0);
        assert!(cred.last_error.is_none());
        assert!(cred.last_error_at.is_none());
        assert_eq!(cred.last_success_at, Some(now));
    }

    #[test]
    fn test_resolve_model() {
        let provider = ApiProvider {
            id: ApiProviderId::new("p"),
            name: "Local".to_string(),
            kind: ApiKind::OpenAi,
            base_url: "http://localhost:1234/v1".to_string(),
            api_key: None,
            models: vec!["llama3".to_string(), "qwen".to_string()],
            enabled: true,
        };
        assert_eq!(provider.resolve_model(None), Some("llama3"));
        assert_eq!(provider.resolve_model(Some("")), Some("llama3"));
        assert_eq!(provider.resolve_model(Some("qwen")), Some("qwen"));
    }
}
