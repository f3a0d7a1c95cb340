//! Applies subtask signals to the store.

use std::sync::Arc;

use agentrun_core::{EngineEvent, SignalKind, Subtask, SubtaskSignal};
use tracing::{debug, info};

use crate::error::EngineError;
use crate::ports::{BroadcastSink, SubtaskRouter, SubtaskStore};

/// Idempotent subtask lifecycle.
///
/// Creation is a no-op when the external id already exists, completion is a
/// no-op when the subtask is missing or already done. Only effective
/// transitions are broadcast.
#[derive(Clone)]
pub struct SubtaskRecorder {
    store: Arc<dyn SubtaskStore>,
    router: Arc<dyn SubtaskRouter>,
    broadcast: Arc<dyn BroadcastSink>,
}

impl SubtaskRecorder {
    pub fn new(
        store: Arc<dyn SubtaskStore>,
        router: Arc<dyn SubtaskRouter>,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Self {
        Self {
            store,
            router,
            broadcast,
        }
    }

    /// Returns whether the signal changed anything.
    pub async fn apply(&self, signal: SubtaskSignal) -> Result<bool, EngineError> {
        let SubtaskSignal {
            task_id,
            external_id,
            kind,
        } = signal;

        match kind {
            SignalKind::Created { title } => {
                if self.store.find_subtask(&task_id, &external_id).await?.is_some() {
                    debug!(task_id = %task_id, external_id = %external_id, "Subtask already exists");
                    return Ok(false);
                }

                let subtask = Subtask::new(task_id.clone(), external_id.clone(), title.clone());
                self.store.insert_subtask(&subtask).await?;
                info!(task_id = %task_id, external_id = %external_id, title = %title, "Subtask created");

                self.publish(EngineEvent::SubtaskCreated {
                    task_id,
                    external_id,
                    title,
                });
                self.router.route(&subtask).await;
                Ok(true)
            }
            SignalKind::Completed => {
                let Some(mut subtask) = self.store.find_subtask(&task_id, &external_id).await?
                else {
                    debug!(task_id = %task_id, external_id = %external_id, "Completion for unknown subtask");
                    return Ok(false);
                };
                if !subtask.complete() {
                    return Ok(false);
                }

                self.store.update_subtask(&subtask).await?;
                info!(task_id = %task_id, external_id = %external_id, "Subtask completed");
                self.publish(EngineEvent::SubtaskCompleted {
                    task_id,
                    external_id,
                });
                Ok(true)
            }
        }
    }

    fn publish(&self, event: EngineEvent) {
        self.broadcast.publish(event.event_type(), event.payload());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryStore, NoopRouter, RecordingSink};
    use agentrun_core::TaskId;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CapturingRouter {
        routed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SubtaskRouter for CapturingRouter {
        async fn route(&self, subtask: &Subtask) {
            self.routed.lock().await.push(subtask.title.clone());
        }
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let recorder = SubtaskRecorder::new(store.clone(), Arc::new(NoopRouter), sink.clone());
        let task = TaskId::new("t");

        assert!(recorder
            .apply(SubtaskSignal::created(task.clone(), "toolu_1", "Write tests"))
            .await
            .unwrap());
        assert!(recorder
            .apply(SubtaskSignal::completed(task.clone(), "toolu_1"))
            .await
            .unwrap());
        assert!(!recorder
            .apply(SubtaskSignal::completed(task.clone(), "toolu_1"))
            .await
            .unwrap());

        assert_eq!(sink.of_type("subtask_completed").len(), 1);
        assert!(store.subtasks_of(&task).await[0].is_done());
    }

    #[tokio::test]
    async fn test_duplicate_creation_routes_once() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let router = Arc::new(CapturingRouter::default());
        let recorder = SubtaskRecorder::new(store.clone(), router.clone(), sink.clone());
        let task = TaskId::new("t");

        for _ in 0..2 {
            recorder
                .apply(SubtaskSignal::created(task.clone(), "plan:write tests", "Write tests"))
                .await
                .unwrap();
        }

        assert_eq!(*router.routed.lock().await, vec!["Write tests".to_string()]);
        let created = sink.of_type("subtask_created");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0]["title"], "Write tests");
    }

    #[tokio::test]
    async fn test_completion_of_unknown_subtask_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let recorder = SubtaskRecorder::new(store, Arc::new(NoopRouter), sink.clone());

        assert!(!recorder
            .apply(SubtaskSignal::completed(TaskId::new("t"), "missing"))
            .await
            .unwrap());
        assert!(sink.events().is_empty());
    }
}
