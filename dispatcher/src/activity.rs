use std::sync::Arc;
use std::time::Duration;

use activities::Activities;
use async_latch::AsyncLatch;
use log::{trace, warn};
use model::{ActivityFailure, ActivityRegistry, HistoryEvent, HistoryEventKind, TaskMessage};
use sessions::Sessions;
use store::Store;

use crate::DispatchError;

/// The activity dispatcher (C7): dequeues an outbound activity message, resolves and runs the
/// user activity it names, and commits the response (success or failure) to the target
/// session's message queue.
///
/// Lock renewal (`RenewTaskOrchestrationWorkItemLock` in the original system) is an explicit
/// non-goal: activity entries are not time-leased, so a worker that crashes mid-activity is only
/// recovered by the boot sweep, not a lease timeout.
#[derive(Clone)]
pub struct ActivityDispatcher {
    store: Store,
    activities: Activities,
    sessions: Sessions,
    registry: Arc<dyn ActivityRegistry>,
    receive_timeout: Duration,
}

impl ActivityDispatcher {
    pub fn new(
        store: Store,
        activities: Activities,
        sessions: Sessions,
        registry: Arc<dyn ActivityRegistry>,
        receive_timeout: Duration,
    ) -> ActivityDispatcher {
        ActivityDispatcher {
            store,
            activities,
            sessions,
            registry,
            receive_timeout,
        }
    }

    /// Runs one worker's cycles until `cancel` fires. Multiple workers may run this
    /// concurrently (`MaxConcurrentActivities`); they share no mutable state besides the store.
    pub async fn run_loop(&self, cancel: &AsyncLatch) {
        loop {
            if cancel.poll_triggered() {
                return;
            }
            match self.run_cycle().await {
                Ok(true) => {}
                Ok(false) => {
                    // Nothing to do; let the next `get_next_work_item` poll absorb the idle time,
                    // but still respect cancellation promptly between cycles.
                    if cancel.poll_triggered() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Activity dispatcher cycle failed: {e}");
                    tokio::select! {
                        biased;
                        () = cancel.triggered() => return,
                        () = tokio::time::sleep(e.backoff()) => {}
                    }
                }
            }
        }
    }

    /// Runs a single cycle. Returns `Ok(true)` if a work item was claimed and processed,
    /// `Ok(false)` if `get_next_work_item` timed out with nothing to do.
    pub async fn run_cycle(&self) -> Result<bool, DispatchError> {
        let Some(item) = self.activities.get_next_work_item(self.receive_timeout).await else {
            return Ok(false);
        };

        let response = match self.run_one(&item.message).await {
            Ok(response) => response,
            Err(infrastructure_error) => {
                warn!("Activity infrastructure failure for {}: {infrastructure_error}", item.message.target_instance);
                self.activities.abandon_work_item(item).await.map_err(DispatchError::Transient)?;
                return Err(DispatchError::Transient(infrastructure_error));
            }
        };

        let target = item.message.target_instance.clone();
        let activities = self.activities.clone();
        let sessions = self.sessions.clone();
        self.store
            .transact(move |txn| {
                activities.complete_work_item_in_txn(txn, &item)?;
                sessions.append_message_in_txn(txn, TaskMessage::new(target, response))
            })
            .await
            .map_err(DispatchError::Transient)?;

        trace!("Completed activity cycle");
        Ok(true)
    }

    /// Runs the user activity named by `message`, producing the response history event. Typed
    /// activity failures and a missing activity type are *not* errors at this layer -- they
    /// become `TaskFailed` response events, per §7. The `Err` case here is reserved for
    /// infrastructure failure: the registry itself could not be reached.
    async fn run_one(&self, message: &TaskMessage) -> Result<HistoryEvent, String> {
        let HistoryEventKind::TaskScheduled { name, version, input } = &message.event.kind else {
            return Err(format!(
                "activity dispatcher received a non-TaskScheduled event for {}",
                message.target_instance
            ));
        };
        let task_scheduled_id = message.event.event_id;

        let outcome = self.registry.run(name, version, input.clone()).await;
        let kind = match outcome {
            Some(Ok(output)) => HistoryEventKind::TaskCompleted { task_scheduled_id, output },
            Some(Err(ActivityFailure { reason, details })) => {
                HistoryEventKind::TaskFailed { task_scheduled_id, reason, details }
            }
            None => HistoryEventKind::TaskFailed {
                task_scheduled_id,
                reason: "TypeMissing".to_string(),
                details: Some(format!("no activity registered for ({name}, {version})")),
            },
        };
        // Response events are assigned their final event_id by the orchestration executor on
        // replay (it owns the history's sequence numbering); this dispatcher only needs the
        // correlation id, so it stamps a placeholder here.
        Ok(HistoryEvent::new(0, kind))
    }
}
