use std::sync::Arc;
use std::time::Duration;

use activities::Activities;
use async_latch::AsyncLatch;
use instance_store::InstanceStore;
use log::{error, trace, warn};
use model::{InstanceId, OrchestrationExecutor, TaskMessage, TimerEntry, Transition, WorkItem};
use sessions::Sessions;
use store::Store;
use timers::Timers;

use crate::DispatchError;

/// The orchestration dispatcher (C6): claims a session, hands its runtime state and newly
/// arrived messages to the caller-supplied `OrchestrationExecutor`, and commits the resulting
/// transition atomically across the activity queue, the session, the timer scheduler, and the
/// instance store.
#[derive(Clone)]
pub struct OrchestrationDispatcher {
    store: Store,
    sessions: Sessions,
    activities: Activities,
    timers: Timers,
    instance_store: InstanceStore,
    executor: Arc<dyn OrchestrationExecutor>,
    receive_timeout: Duration,
}

impl OrchestrationDispatcher {
    pub fn new(
        store: Store,
        sessions: Sessions,
        activities: Activities,
        timers: Timers,
        instance_store: InstanceStore,
        executor: Arc<dyn OrchestrationExecutor>,
        receive_timeout: Duration,
    ) -> OrchestrationDispatcher {
        OrchestrationDispatcher {
            store,
            sessions,
            activities,
            timers,
            instance_store,
            executor,
            receive_timeout,
        }
    }

    /// Runs cycles until `cancel` fires. Never starts a fresh cycle after cancellation, but a
    /// cycle already past its `accept_session` claim runs to completion (commit, then release).
    pub async fn run_loop(&self, cancel: &AsyncLatch) {
        loop {
            if cancel.poll_triggered() {
                return;
            }
            if let Err(e) = self.run_cycle(cancel).await {
                warn!("Orchestration dispatcher cycle failed: {e}");
                let backoff = e.backoff();
                if !backoff.is_zero() {
                    tokio::select! {
                        biased;
                        () = cancel.triggered() => return,
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    /// Runs a single cycle. Returns `Ok(true)` if a session was claimed and processed,
    /// `Ok(false)` if `accept_session` timed out with nothing to do.
    pub async fn run_cycle(&self, cancel: &AsyncLatch) -> Result<bool, DispatchError> {
        let Some(session) = self.sessions.accept_session(self.receive_timeout, cancel).await else {
            return Ok(false);
        };
        let instance = session.session_id.clone();

        // Every session with a claimable message has a corresponding Pending/Running row in the
        // instance store, written transactionally alongside that message's append (`create_instance`
        // for the first message of an instance; every later cycle's own commit for the rest) -- so
        // this lookup cannot miss. A failure here abandons the claim just like an executor error,
        // rather than leaving the session locked until a restart's boot sweep.
        let current = match self.instance_store.get_state(&instance).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                self.sessions.abandon_session(instance.clone()).await.map_err(DispatchError::Fatal)?;
                return Err(DispatchError::Fatal(format!("no instance state found for session {instance}")));
            }
            Err(e) => {
                self.sessions.abandon_session(instance.clone()).await.map_err(DispatchError::Fatal)?;
                return Err(DispatchError::Transient(e));
            }
        };

        let work_item = WorkItem {
            instance: instance.clone(),
            execution: current.execution,
            runtime_state: session.runtime_state.clone(),
            new_messages: session.messages().to_vec(),
        };

        let transition = match self.executor.execute(work_item).await {
            Ok(t) => t,
            Err(e) => {
                error!("Executor failed for instance {instance}: {e}");
                self.sessions.abandon_session(instance.clone()).await.map_err(DispatchError::Fatal)?;
                return Err(DispatchError::Fatal(e));
            }
        };

        if transition.continue_as_new {
            error!("Instance {instance} requested ContinueAsNew, which this core does not support");
            return Err(DispatchError::Unsupported("ContinueAsNew"));
        }

        if let Err(e) = self.commit_transition(&instance, transition).await {
            self.sessions.abandon_session(instance.clone()).await.map_err(DispatchError::Fatal)?;
            return Err(DispatchError::Transient(e));
        }

        trace!("Completed orchestration cycle for instance {instance}");
        Ok(true)
    }

    async fn commit_transition(&self, instance: &InstanceId, transition: Transition) -> Result<(), String> {
        let timer_entries = to_timer_entries(&transition.timer_msgs)?;
        let final_states: Vec<_> = transition.final_state.iter().cloned().collect();
        let archive = self.instance_store.open_archive_if_needed(&final_states)?;

        let sessions = self.sessions.clone();
        let activities = self.activities.clone();
        let timers = self.timers.clone();
        let instance_store = self.instance_store.clone();
        let instance = instance.clone();
        let is_terminal = transition
            .final_state
            .as_ref()
            .map(|s| s.status.is_terminal())
            .unwrap_or(false);

        let scheduled_a_timer = !timer_entries.is_empty();
        self.store
            .transact(move |txn| {
                activities.append_batch_in_txn(txn, transition.outbound_activity_msgs)?;
                sessions.complete_and_update_session_in_txn(txn, &instance, transition.new_runtime_state)?;
                if !transition.orchestrator_msgs.is_empty() {
                    sessions.append_message_batch_in_txn(txn, transition.orchestrator_msgs)?;
                }
                timers.schedule_in_txn(txn, timer_entries)?;
                if let Some(final_state) = transition.final_state {
                    instance_store.write_entities_in_txn(txn, archive.as_ref(), vec![final_state])?;
                }
                Ok(())
            })
            .await?;

        if scheduled_a_timer {
            self.timers.wake_loop();
        }
        if is_terminal {
            self.sessions.release_session(instance).await?;
        }
        Ok(())
    }
}

fn to_timer_entries(messages: &[TaskMessage]) -> Result<Vec<TimerEntry>, String> {
    messages
        .iter()
        .map(|message| {
            let fire_at = message
                .event
                .fire_at()
                .ok_or_else(|| format!("timer message for {} carries no fire_at", message.target_instance))?;
            Ok(TimerEntry::new(fire_at, message.clone()))
        })
        .collect()
}
