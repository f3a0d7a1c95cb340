//! Collaborators the engine reaches through narrow traits.
//!
//! Persistence, encryption, event fan-out and routing all live outside the
//! engine. In-memory implementations are in [`crate::memory`].

use std::sync::Arc;

use agentrun_core::{
    ApiProvider, ApiProviderId, Credential, CredentialId, OAuthProvider, Subtask, TaskId,
};
use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use thiserror::Error;

use crate::supervisor::RunOutcome;

/// Failure reported by a store implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

/// Failure reported by a cipher implementation.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CryptoError(pub String);

/// Persistent credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Active credentials of one provider, ordered by priority rank.
    async fn active_credentials(
        &self,
        provider: OAuthProvider,
    ) -> Result<Vec<Credential>, StoreError>;

    async fn get_credential(&self, id: &CredentialId) -> Result<Option<Credential>, StoreError>;

    async fn save_credential(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Persist a new rank order: the first id gets rank 0, the next 1, and so on.
    async fn set_priorities(
        &self,
        provider: OAuthProvider,
        order: &[CredentialId],
    ) -> Result<(), StoreError>;
}

/// User-configured API endpoints.
#[async_trait]
pub trait ApiProviderStore: Send + Sync {
    async fn get_api_provider(&self, id: &ApiProviderId)
        -> Result<Option<ApiProvider>, StoreError>;
}

/// Subtask rows keyed by `(task_id, external_id)`.
#[async_trait]
pub trait SubtaskStore: Send + Sync {
    async fn find_subtask(
        &self,
        task_id: &TaskId,
        external_id: &str,
    ) -> Result<Option<Subtask>, StoreError>;

    async fn insert_subtask(&self, subtask: &Subtask) -> Result<(), StoreError>;

    async fn update_subtask(&self, subtask: &Subtask) -> Result<(), StoreError>;
}

/// Symmetric encryption of secrets at rest.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, CryptoError>;
}

/// Fan-out of engine events to observers.
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, event_type: &str, payload: Value);
}

/// Durable per-task log.
#[async_trait]
pub trait TaskLog: Send + Sync {
    async fn append_log(&self, task_id: &TaskId, kind: &str, message: &str)
        -> Result<(), StoreError>;
}

/// Called after a subtask has been created, to assign it somewhere.
#[async_trait]
pub trait SubtaskRouter: Send + Sync {
    async fn route(&self, subtask: &Subtask);
}

/// Called once per run after cleanup.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, outcome: &RunOutcome);
}

/// Every collaborator the engine needs.
#[derive(Clone)]
pub struct Ports {
    pub credentials: Arc<dyn CredentialStore>,
    pub api_providers: Arc<dyn ApiProviderStore>,
    pub subtasks: Arc<dyn SubtaskStore>,
    pub cipher: Arc<dyn Cipher>,
    pub broadcast: Arc<dyn BroadcastSink>,
    pub task_log: Arc<dyn TaskLog>,
    pub router: Arc<dyn SubtaskRouter>,
    pub completion: Arc<dyn CompletionHook>,
}

impl std::fmt::Debug for Ports {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ports").finish_non_exhaustive()
    }
}
