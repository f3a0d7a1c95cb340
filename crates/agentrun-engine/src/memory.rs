//! In-memory implementations of the engine ports.
//!
//! Used by tests and by the `agentrun` binary, which seeds a [`MemoryStore`]
//! from a JSON file. [`Base64Cipher`] is reversible encoding, not encryption.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agentrun_core::{
    ApiProvider, ApiProviderId, Credential, CredentialId, OAuthProvider, Subtask, TaskId,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::ports::{
    ApiProviderStore, BroadcastSink, Cipher, CompletionHook, CredentialStore, CryptoError, Ports,
    StoreError, SubtaskRouter, SubtaskStore, TaskLog,
};
use crate::supervisor::RunOutcome;

/// Contents of a store seed file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub credentials: Vec<Credential>,
    #[serde(default)]
    pub api_providers: Vec<ApiProvider>,
}

/// Credentials, API providers and subtasks held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: RwLock<HashMap<CredentialId, Credential>>,
    api_providers: RwLock<HashMap<ApiProviderId, ApiProvider>>,
    subtasks: RwLock<HashMap<(TaskId, String), Subtask>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: StoreSeed) -> Self {
        Self {
            credentials: RwLock::new(
                seed.credentials
                    .into_iter()
                    .map(|c| (c.id.clone(), c))
                    .collect(),
            ),
            api_providers: RwLock::new(
                seed.api_providers
                    .into_iter()
                    .map(|p| (p.id.clone(), p))
                    .collect(),
            ),
            subtasks: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert_credential(&self, credential: Credential) {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential);
    }

    pub async fn insert_api_provider(&self, provider: ApiProvider) {
        self.api_providers
            .write()
            .await
            .insert(provider.id.clone(), provider);
    }

    /// Snapshot of one credential.
    pub async fn credential(&self, id: &CredentialId) -> Option<Credential> {
        self.credentials.read().await.get(id).cloned()
    }

    /// Subtasks of a task, oldest first.
    pub async fn subtasks_of(&self, task_id: &TaskId) -> Vec<Subtask> {
        let mut subtasks: Vec<Subtask> = self
            .subtasks
            .read()
            .await
            .values()
            .filter(|s| &s.task_id == task_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.created_at);
        subtasks
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn active_credentials(
        &self,
        provider: OAuthProvider,
    ) -> Result<Vec<Credential>, StoreError> {
        let mut active: Vec<Credential> = self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.provider == provider && c.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(active)
    }

    async fn get_credential(&self, id: &CredentialId) -> Result<Option<Credential>, StoreError> {
        Ok(self.credential(id).await)
    }

    async fn save_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn set_priorities(
        &self,
        provider: OAuthProvider,
        order: &[CredentialId],
    ) -> Result<(), StoreError> {
        let mut credentials = self.credentials.write().await;
        for (rank, id) in order.iter().enumerate() {
            if let Some(credential) = credentials.get_mut(id) {
                if credential.provider == provider {
                    credential.priority = rank as i32;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ApiProviderStore for MemoryStore {
    async fn get_api_provider(
        &self,
        id: &ApiProviderId,
    ) -> Result<Option<ApiProvider>, StoreError> {
        Ok(self.api_providers.read().await.get(id).cloned())
    }
}

#[async_trait]
impl SubtaskStore for MemoryStore {
    async fn find_subtask(
        &self,
        task_id: &TaskId,
        external_id: &str,
    ) -> Result<Option<Subtask>, StoreError> {
        Ok(self
            .subtasks
            .read()
            .await
            .get(&(task_id.clone(), external_id.to_string()))
            .cloned())
    }

    async fn insert_subtask(&self, subtask: &Subtask) -> Result<(), StoreError> {
        let key = (subtask.task_id.clone(), subtask.external_id.clone());
        let mut subtasks = self.subtasks.write().await;
        if subtasks.contains_key(&key) {
            return Err(StoreError(format!(
                "subtask '{}' already exists for task {}",
                subtask.external_id, subtask.task_id
            )));
        }
        subtasks.insert(key, subtask.clone());
        Ok(())
    }

    async fn update_subtask(&self, subtask: &Subtask) -> Result<(), StoreError> {
        let key = (subtask.task_id.clone(), subtask.external_id.clone());
        match self.subtasks.write().await.get_mut(&key) {
            Some(existing) => {
                *existing = subtask.clone();
                Ok(())
            }
            None => Err(StoreError(format!(
                "subtask '{}' not found for task {}",
                subtask.external_id, subtask.task_id
            ))),
        }
    }
}

/// Prefix marking values produced by [`Base64Cipher`].
const BASE64_PREFIX: &str = "b64:";

/// Reversible base64 "cipher" for development and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64Cipher;

impl Cipher for Base64Cipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(format!("{BASE64_PREFIX}{}", STANDARD.encode(plaintext)))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CryptoError> {
        let encoded = ciphertext
            .strip_prefix(BASE64_PREFIX)
            .ok_or_else(|| CryptoError("value is not base64-wrapped".to_string()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError(format!("invalid base64: {e}")))?;
        let plaintext =
            String::from_utf8(bytes).map_err(|_| CryptoError("plaintext is not UTF-8".to_string()))?;
        Ok(SecretString::from(plaintext))
    }
}

/// Records every published event in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Payloads of one event type.
    pub fn of_type(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl BroadcastSink for RecordingSink {
    fn publish(&self, event_type: &str, payload: Value) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((event_type.to_string(), payload));
    }
}

/// One task log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub task_id: TaskId,
    pub kind: String,
    pub message: String,
}

/// Task log kept in memory.
#[derive(Debug, Default)]
pub struct MemoryTaskLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryTaskLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl TaskLog for MemoryTaskLog {
    async fn append_log(
        &self,
        task_id: &TaskId,
        kind: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        self.entries.write().await.push(LogEntry {
            task_id: task_id.clone(),
            kind: kind.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

/// Router that leaves subtasks where they are.
#[derive(Debug, Default)]
pub struct NoopRouter;

#[async_trait]
impl SubtaskRouter for NoopRouter {
    async fn route(&self, _subtask: &Subtask) {}
}

/// Completion hook that does nothing.
#[derive(Debug, Default)]
pub struct NoopCompletion;

#[async_trait]
impl CompletionHook for NoopCompletion {
    async fn on_complete(&self, _outcome: &RunOutcome) {}
}

impl Ports {
    /// Ports backed by one [`MemoryStore`] and a [`Base64Cipher`].
    pub fn in_memory(
        store: Arc<MemoryStore>,
        broadcast: Arc<dyn BroadcastSink>,
        task_log: Arc<dyn TaskLog>,
    ) -> Self {
        Self {
            credentials: store.clone(),
            api_providers: store.clone(),
            subtasks: store,
            cipher: Arc::new(Base64Cipher),
            broadcast,
            task_log,
            router: Arc::new(NoopRouter),
            completion: Arc::new(NoopCompletion),
        }
    }

    /// Builder method to replace the routing hook.
    pub fn with_router(mut self, router: Arc<dyn SubtaskRouter>) -> Self {
        self.router = router;
        self
    }

    /// Builder method to replace the completion hook.
    pub fn with_completion(mut self, completion: Arc<dyn CompletionHook>) -> Self {
        self.completion = completion;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_base64_cipher_reverses() {
        let cipher = Base64Cipher;
        let sealed = cipher.encrypt("ghu_secret").unwrap();
        assert!(sealed.starts_with(BASE64_PREFIX));
        assert!(!sealed.contains("ghu_secret"));
        assert_eq!(cipher.decrypt(&sealed).unwrap().expose_secret(), "ghu_secret");
        assert!(cipher.decrypt("plain").is_err());
    }

    #[tokio::test]
    async fn test_active_credentials_ordered_by_priority() {
        let store = MemoryStore::new();
        store
            .insert_credential(Credential::new("b", OAuthProvider::Copilot).with_priority(1))
            .await;
        store
            .insert_credential(Credential::new("a", OAuthProvider::Copilot).with_priority(2))
            .await;
        let mut disabled = Credential::new("c", OAuthProvider::Copilot);
        disabled.status = agentrun_core::CredentialStatus::Disabled;
        store.insert_credential(disabled).await;
        store
            .insert_credential(Credential::new("g", OAuthProvider::Antigravity))
            .await;

        let ids: Vec<String> = store
            .active_credentials(OAuthProvider::Copilot)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id.into_inner())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        store
            .set_priorities(OAuthProvider::Copilot, &[CredentialId::new("a"), CredentialId::new("b")])
            .await
            .unwrap();
        let first = store.active_credentials(OAuthProvider::Copilot).await.unwrap();
        assert_eq!(first[0].id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_subtask_insert_rejects_duplicates() {
        let store = MemoryStore::new();
        let subtask = Subtask::new(TaskId::new("t"), "toolu_1", "Write tests");
        store.insert_subtask(&subtask).await.unwrap();
        assert!(store.insert_subtask(&subtask).await.is_err());
        assert_eq!(store.subtasks_of(&TaskId::new("t")).await.len(), 1);
    }

    #[test]
    fn test_seed_parses() {
        let seed: StoreSeed = serde_json::from_str(
            r#"{"credentials":[{"id":"c1","provider":"copilot","access_token":"b64:eA=="}],
                "api_providers":[{"id":"local","name":"Local","kind":"openai","base_url":"http://localhost:1234/v1","models":["llama3"]}]}"#,
        )
        .unwrap();
        assert_eq!(seed.credentials.len(), 1);
        assert!(seed.api_providers[0].enabled);
    }
}
