// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! The client façade (C8): the external-caller surface for starting, querying, signalling, and
//! terminating orchestration instances.
//!
//! Each operation here commits its own single transaction: unlike the dispatchers, the façade
//! never composes a write across more than one caller-visible intent, so there is no need for an
//! `_in_txn` half of any of these methods (see `dispatcher` for the pattern where that does
//! matter).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use log::debug;
use serde_json::Value;

use instance_store::InstanceStore;
use model::{ExecutionId, HistoryEvent, HistoryEventKind, InstanceId, OrchestrationState, TaskMessage};
use sessions::Sessions;
use store::Store;

/// How often `wait_for_instance` re-polls `get_state` while the instance is still running.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The handle `create_instance` returns: enough to address subsequent calls at the instance and
/// execution the caller just started.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OrchestrationInstance {
    pub instance: InstanceId,
    pub execution: ExecutionId,
}

#[derive(Clone)]
pub struct Client {
    store: Store,
    sessions: Sessions,
    instance_store: InstanceStore,
}

impl Client {
    pub fn new(store: Store, sessions: Sessions, instance_store: InstanceStore) -> Client {
        Client { store, sessions, instance_store }
    }

    /// Starts a new instance: appends an `ExecutionStarted` message into its (fresh) session and
    /// writes its Pending state into the instance store, atomically. `instance_id` defaults to a
    /// generated UUID if not given; `execution_id` is always generated fresh.
    pub async fn create_instance(
        &self,
        name: String,
        version: String,
        instance_id: Option<InstanceId>,
        input: Option<Value>,
        tags: Option<BTreeMap<String, String>>,
    ) -> Result<OrchestrationInstance, String> {
        let instance = instance_id.unwrap_or_else(InstanceId::generate);
        let execution = ExecutionId::generate();
        let now = Utc::now();

        let started = HistoryEvent::new(
            0,
            HistoryEventKind::ExecutionStarted {
                name: name.clone(),
                version: version.clone(),
                input: input.clone(),
            },
        );
        let message = TaskMessage::new(instance.clone(), started);
        let state = OrchestrationState::pending(
            instance.clone(),
            execution.clone(),
            name,
            version,
            input,
            tags.unwrap_or_default(),
            now,
        );

        let sessions = self.sessions.clone();
        let instance_store = self.instance_store.clone();
        self.store
            .transact(move |txn| {
                sessions.append_message_in_txn(txn, message)?;
                instance_store.write_entities_in_txn(txn, None, vec![state])
            })
            .await?;

        debug!("Started instance {instance} (execution {execution})");
        Ok(OrchestrationInstance { instance, execution })
    }

    /// Appends an `EventRaised` message to `instance_id`'s session, to be observed on its next
    /// dispatcher cycle. A no-op from the caller's perspective if the instance has already
    /// finished: the message is durably queued regardless, but no session will ever claim it.
    pub async fn raise_event(&self, instance_id: InstanceId, name: String, input: Option<Value>) -> Result<(), String> {
        let event = HistoryEvent::new(0, HistoryEventKind::EventRaised { name, input });
        self.sessions.append_message(TaskMessage::new(instance_id, event)).await
    }

    /// Appends an `ExecutionTerminated` message, which the executor turns into the terminal
    /// status on its next cycle. Termination is not immediate: it is observed the same way any
    /// other message is.
    pub async fn terminate_instance(&self, instance_id: InstanceId, reason: String) -> Result<(), String> {
        let event = HistoryEvent::new(0, HistoryEventKind::ExecutionTerminated { reason });
        self.sessions.append_message(TaskMessage::new(instance_id, event)).await
    }

    /// Delegates to the instance store's read rule (§4.5): the most recent execution's state, or
    /// `None` if never started or aged out past the archive horizon.
    pub async fn get_state(&self, instance_id: &InstanceId) -> Result<Option<OrchestrationState>, String> {
        self.instance_store.get_state(instance_id).await
    }

    /// Looks up a specific execution's state, bypassing the latest-execution pointer.
    pub async fn get_state_for_execution(
        &self,
        instance_id: &InstanceId,
        execution_id: &ExecutionId,
    ) -> Result<Option<OrchestrationState>, String> {
        self.instance_store.get_state_for_execution(instance_id, execution_id).await
    }

    /// Polls `get_state` every 30s until the instance reaches a terminal status or `timeout`
    /// elapses. Returns the last-observed state either way; `None` if the instance was never
    /// found (or aged out of the archive) on any poll.
    pub async fn wait_for_instance(
        &self,
        instance_id: &InstanceId,
        timeout: Duration,
    ) -> Result<Option<OrchestrationState>, String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.get_state(instance_id).await?;
            if let Some(s) = &state {
                if s.status.is_terminal() {
                    return Ok(state);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests;
