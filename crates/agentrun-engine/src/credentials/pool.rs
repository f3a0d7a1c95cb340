//! Rotating credential pools.
//!
//! Each provider keeps an ordered list of active credential ids and a
//! rotation cursor. A dispatch without a pinned credential starts at the
//! cursor and advances it by one; a pinned credential goes first and leaves
//! the cursor alone. Every operation on one provider's pool runs under that
//! provider's lock.

use std::collections::HashMap;
use std::sync::Arc;

use agentrun_core::{Credential, CredentialId, OAuthProvider};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::ports::CredentialStore;

#[derive(Debug, Default)]
struct PoolState {
    order: Vec<CredentialId>,
    cursor: usize,
}

impl PoolState {
    /// Adopt the store's current active set, keeping the cursor in range.
    fn reconcile(&mut self, active: &[Credential]) {
        self.order = active.iter().map(|c| c.id.clone()).collect();
        if self.order.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.order.len();
        }
    }

    fn next_order(&mut self, pinned: Option<&CredentialId>) -> Vec<CredentialId> {
        if let Some(pinned) = pinned.filter(|p| self.order.contains(p)) {
            let mut order = vec![pinned.clone()];
            order.extend(self.order.iter().filter(|id| *id != pinned).cloned());
            return order;
        }

        if self.order.is_empty() {
            return Vec::new();
        }
        let mut order = self.order[self.cursor..].to_vec();
        order.extend_from_slice(&self.order[..self.cursor]);
        self.cursor = (self.cursor + 1) % self.order.len();
        order
    }

    fn promote(&mut self, id: &CredentialId) -> bool {
        match self.order.iter().position(|c| c == id) {
            Some(0) | None => false,
            Some(pos) => {
                let promoted = self.order.remove(pos);
                self.order.insert(0, promoted);
                true
            }
        }
    }
}

/// Credential pools of every OAuth provider.
pub struct CredentialPools {
    store: Arc<dyn CredentialStore>,
    pools: Mutex<HashMap<OAuthProvider, Arc<Mutex<PoolState>>>>,
}

impl CredentialPools {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            store,
            pools: Mutex::new(HashMap::new()),
        }
    }

    async fn pool(&self, provider: OAuthProvider) -> Arc<Mutex<PoolState>> {
        self.pools
            .lock()
            .await
            .entry(provider)
            .or_default()
            .clone()
    }

    /// Active credentials in the order they should be tried.
    pub async fn candidates(
        &self,
        provider: OAuthProvider,
        pinned: Option<&CredentialId>,
    ) -> Result<Vec<Credential>, EngineError> {
        let pool = self.pool(provider).await;
        let mut state = pool.lock().await;

        let active = self.store.active_credentials(provider).await?;
        state.reconcile(&active);
        let order = state.next_order(pinned);

        if let Some(pinned) = pinned {
            if order.first() != Some(pinned) {
                warn!(provider = provider.as_str(), credential = %pinned, "Pinned credential is not active, rotating instead");
            }
        }
        debug!(provider = provider.as_str(), cursor = state.cursor, candidates = order.len(), "Selected credential order");

        let mut by_id: HashMap<CredentialId, Credential> =
            active.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(order.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Clear failure bookkeeping; with `promote`, move the credential to the front.
    pub async fn record_success(
        &self,
        provider: OAuthProvider,
        id: &CredentialId,
        promote: bool,
    ) -> Result<(), EngineError> {
        let pool = self.pool(provider).await;
        let mut state = pool.lock().await;

        if let Some(mut credential) = self.store.get_credential(id).await? {
            credential.mark_success(Utc::now());
            self.store.save_credential(&credential).await?;
        }

        if promote {
            let active = self.store.active_credentials(provider).await?;
            state.reconcile(&active);
        }
        if promote && state.promote(id) {
            self.store.set_priorities(provider, &state.order).await?;
            info!(provider = provider.as_str(), credential = %id, "Promoted credential to the front of the pool");
        }
        Ok(())
    }

    /// Count a failed attempt and keep its error message.
    pub async fn record_failure(
        &self,
        provider: OAuthProvider,
        id: &CredentialId,
        message: &str,
    ) -> Result<(), EngineError> {
        let pool = self.pool(provider).await;
        let _state = pool.lock().await;

        if let Some(mut credential) = self.store.get_credential(id).await? {
            credential.mark_failure(message, Utc::now());
            self.store.save_credential(&credential).await?;
            warn!(
                provider = provider.as_str(),
                credential = %id,
                failures = credential.failure_count,
                "Credential attempt failed"
            );
        }
        Ok(())
    }

    /// Current rotation cursor of a provider.
    pub async fn cursor(&self, provider: OAuthProvider) -> usize {
        self.pool(provider).await.lock().await.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    async fn pools_with(ids: &[&str]) -> (CredentialPools, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (rank, id) in ids.iter().enumerate() {
            store
                .insert_credential(
                    Credential::new(*id, OAuthProvider::Copilot).with_priority(rank as i32),
                )
                .await;
        }
        (CredentialPools::new(store.clone()), store)
    }

    fn ids(credentials: &[Credential]) -> Vec<&str> {
        credentials.iter().map(|c| c.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_rotation_advances_cursor_by_one() {
        let (pools, _) = pools_with(&["a", "b", "c"]).await;
        let provider = OAuthProvider::Copilot;

        for round in 0..7 {
            let before = pools.cursor(provider).await;
            let candidates = pools.candidates(provider, None).await.unwrap();
            assert_eq!(candidates.len(), 3);
            assert_eq!(pools.cursor(provider).await, (before + 1) % 3, "round {round}");
        }

        let (pools, _) = pools_with(&["a", "b", "c"]).await;
        assert_eq!(ids(&pools.candidates(provider, None).await.unwrap()), ["a", "b", "c"]);
        assert_eq!(ids(&pools.candidates(provider, None).await.unwrap()), ["b", "c", "a"]);
        assert_eq!(ids(&pools.candidates(provider, None).await.unwrap()), ["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_pinned_never_moves_cursor() {
        let (pools, _) = pools_with(&["a", "b", "c"]).await;
        let provider = OAuthProvider::Copilot;
        pools.candidates(provider, None).await.unwrap();

        let pinned = CredentialId::new("c");
        let candidates = pools.candidates(provider, Some(&pinned)).await.unwrap();
        assert_eq!(ids(&candidates), ["c", "a", "b"]);
        assert_eq!(pools.cursor(provider).await, 1);

        // Unknown pin falls back to rotation.
        let missing = CredentialId::new("zzz");
        let candidates = pools.candidates(provider, Some(&missing)).await.unwrap();
        assert_eq!(ids(&candidates), ["b", "c", "a"]);
        assert_eq!(pools.cursor(provider).await, 2);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let (pools, _) = pools_with(&[]).await;
        assert!(pools
            .candidates(OAuthProvider::Antigravity, None)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(pools.cursor(OAuthProvider::Antigravity).await, 0);
    }

    #[tokio::test]
    async fn test_cursor_stays_in_range_when_pool_shrinks() {
        let (pools, store) = pools_with(&["a", "b", "c"]).await;
        let provider = OAuthProvider::Copilot;
        pools.candidates(provider, None).await.unwrap();
        pools.candidates(provider, None).await.unwrap();
        assert_eq!(pools.cursor(provider).await, 2);

        let mut c = store.credential(&CredentialId::new("c")).await.unwrap();
        c.status = agentrun_core::CredentialStatus::Disabled;
        store.insert_credential(c).await;

        let candidates = pools.candidates(provider, None).await.unwrap();
        assert_eq!(ids(&candidates), ["a", "b"]);
        assert_eq!(pools.cursor(provider).await, 1);
    }

    #[tokio::test]
    async fn test_success_promotes_and_persists() {
        let (pools, store) = pools_with(&["a", "b"]).await;
        let provider = OAuthProvider::Copilot;
        let b = CredentialId::new("b");

        pools.record_failure(provider, &b, "HTTP 500").await.unwrap();
        pools.record_success(provider, &b, true).await.unwrap();

        let stored = store.credential(&b).await.unwrap();
        assert_eq!(stored.failure_count, 0);
        assert!(stored.last_success_at.is_some());
        assert_eq!(stored.priority, 0);
        assert_eq!(store.credential(&CredentialId::new("a")).await.unwrap().priority, 1);
    }

    #[tokio::test]
    async fn test_failure_bookkeeping() {
        let (pools, store) = pools_with(&["a"]).await;
        let a = CredentialId::new("a");
        let long = "e".repeat(800);

        pools.record_failure(OAuthProvider::Copilot, &a, &long).await.unwrap();
        pools.record_failure(OAuthProvider::Copilot, &a, &long).await.unwrap();

        let stored = store.credential(&a).await.unwrap();
        assert_eq!(stored.failure_count, 2);
        assert_eq!(stored.last_error.unwrap().len(), agentrun_core::credential::MAX_ERROR_LEN);
        assert!(stored.last_error_at.is_some());
    }
}
