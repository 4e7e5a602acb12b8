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

//! The session store (C2): a durable, per-instance container of runtime state plus an inbound
//! message queue, with an at-most-one in-flight lock per session.
//!
//! Backed by a single `store::Dict<PersistentSession>` under the reserved name
//! `Sess_Orchestrations`. Every mutator either runs inside a caller-supplied `store::Txn` (so the
//! orchestration dispatcher can compose it with activity/timer/instance-state writes into one
//! atomic commit, per invariant 4 of the data model) or opens its own single-dictionary
//! transaction for standalone callers such as the client façade.

use std::time::Duration;

use async_latch::AsyncLatch;
use log::trace;
use model::{HistoryEvent, InstanceId, LockableTaskMessage, PersistentSession, TaskMessage};
use store::{Dict, EnumerateMode, Store, Txn};

/// Reserved dictionary name for the session store, per the persisted state layout.
pub const DICTIONARY_NAME: &str = "Sess_Orchestrations";

/// How long `accept_session` backs off between unsuccessful scans.
const POLL_BACKOFF: Duration = Duration::from_millis(100);

/// A session claimed by one dispatcher cycle: the runtime state accumulated so far, and the
/// messages that were unlocked (and are now locked, in-flight for this cycle) at claim time.
#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub session_id: InstanceId,
    pub runtime_state: Vec<HistoryEvent>,
    claimed: Vec<TaskMessage>,
}

impl Session {
    /// Pure projection of the messages claimed by the `accept_session` call that produced this
    /// snapshot, in append order.
    pub fn messages(&self) -> &[TaskMessage] {
        &self.claimed
    }
}

#[derive(Clone)]
pub struct Sessions {
    store: Store,
    dict: Dict<PersistentSession>,
}

impl Sessions {
    pub fn new(store: Store) -> Result<Sessions, String> {
        let dict = store.open_dictionary(DICTIONARY_NAME)?;
        Ok(Sessions { store, dict })
    }

    /// Clears the `locked` bit on every session in the store. Run once at boot (see the boot
    /// sweep in `engine`): stale locks surviving a crash are never renewed, only repaired here.
    pub async fn boot_sweep(&self) -> Result<usize, String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                let rows = txn.enumerate(&dict, EnumerateMode::Unordered)?;
                let mut cleared = 0;
                for (key, session) in rows {
                    if session.locked || session.messages.iter().any(|m| m.locked) {
                        let mut next = session.clone();
                        next.locked = false;
                        for m in &mut next.messages {
                            m.locked = false;
                        }
                        txn.set(&dict, &key, &next)?;
                        cleared += 1;
                    }
                }
                Ok(cleared)
            })
            .await
    }

    /// Polls for an unlocked session with at least one unlocked message, claiming it atomically.
    /// Returns `None` after `receive_timeout` elapses, or immediately if `cancel` is triggered.
    pub async fn accept_session(&self, receive_timeout: Duration, cancel: &AsyncLatch) -> Option<Session> {
        let deadline = tokio::time::Instant::now() + receive_timeout;
        loop {
            if cancel.poll_triggered() {
                return None;
            }
            match self.try_claim_one().await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Error scanning for a claimable session: {e}");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::select! {
                biased;
                () = cancel.triggered() => return None,
                () = tokio::time::sleep(POLL_BACKOFF) => {}
            }
        }
    }

    async fn try_claim_one(&self) -> Result<Option<Session>, String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                let rows = txn.enumerate(&dict, EnumerateMode::Unordered)?;
                for (key, session) in rows {
                    if session.has_claimable_messages() {
                        let (claimed_session, claimed) = session.with_claimed()?;
                        txn.set(&dict, &key, &claimed_session)?;
                        return Ok(Some(Session {
                            session_id: claimed_session.session_id,
                            runtime_state: claimed_session.runtime_state,
                            claimed,
                        }));
                    }
                }
                Ok(None)
            })
            .await
    }

    /// Within `txn`: replaces the session's runtime state with `new_runtime_state`, drops the
    /// messages that were claimed by this cycle (retaining any that arrived afterwards), and
    /// clears the lock bit. If the new state is terminal, the row itself is left in place for
    /// `release_session_in_txn` to remove; only the removal is deferred, not the unlock.
    pub fn complete_and_update_session_in_txn(
        &self,
        txn: &mut Txn<'_>,
        instance_id: &InstanceId,
        new_runtime_state: Vec<HistoryEvent>,
    ) -> Result<(), String> {
        let key = instance_id.as_str().as_bytes();
        let session = txn
            .try_get(&self.dict, key)?
            .ok_or_else(|| format!("No session found for instance {instance_id}"))?;
        let next = session.with_transition_applied(new_runtime_state);
        txn.set(&self.dict, key, &next)
    }

    /// Within `txn`: appends `message` to its target instance's session, creating a fresh,
    /// unlocked session if none exists yet.
    pub fn append_message_in_txn(&self, txn: &mut Txn<'_>, message: TaskMessage) -> Result<(), String> {
        let key = message.target_instance.as_str().as_bytes().to_vec();
        let current = txn
            .try_get(&self.dict, &key)?
            .unwrap_or_else(|| PersistentSession::new(message.target_instance.clone()));
        let next = current.with_message_appended(message);
        txn.set(&self.dict, &key, &next)
    }

    /// Within `txn`: appends each message, preserving the given order per target instance
    /// (invariant 2: messages are never re-ordered once appended).
    pub fn append_message_batch_in_txn(
        &self,
        txn: &mut Txn<'_>,
        messages: Vec<TaskMessage>,
    ) -> Result<(), String> {
        for message in messages {
            self.append_message_in_txn(txn, message)?;
        }
        Ok(())
    }

    /// Within `txn`: if the session's runtime state is terminal, removes it from the store
    /// entirely (invariant 3); otherwise clears the lock bit so the next `accept_session` scan
    /// can claim it again.
    pub fn release_session_in_txn(&self, txn: &mut Txn<'_>, instance_id: &InstanceId) -> Result<(), String> {
        let key = instance_id.as_str().as_bytes();
        let Some(session) = txn.try_get(&self.dict, key)? else {
            return Ok(());
        };
        if is_terminal_session(&session) {
            txn.try_remove(&self.dict, key)?;
        } else {
            let mut next = session;
            next.locked = false;
            txn.set(&self.dict, key, &next)?;
        }
        Ok(())
    }

    /// Within `txn`: clears the lock on the session and on every message it holds, restoring it
    /// to the state `accept_session` found it in before this cycle's claim. Used when a cycle
    /// fails before it can commit a transition (executor error, or a transient store error on
    /// commit): the claim is given up so the next `accept_session` scan can retry it, instead of
    /// leaving the session locked until a process restart's boot sweep.
    pub fn abandon_session_in_txn(&self, txn: &mut Txn<'_>, instance_id: &InstanceId) -> Result<(), String> {
        let key = instance_id.as_str().as_bytes();
        let Some(mut session) = txn.try_get(&self.dict, key)? else {
            return Ok(());
        };
        session.locked = false;
        for message in &mut session.messages {
            message.locked = false;
        }
        txn.set(&self.dict, key, &session)
    }

    pub async fn abandon_session(&self, instance_id: InstanceId) -> Result<(), String> {
        let sessions = self.clone();
        self.store
            .transact(move |txn| sessions.abandon_session_in_txn(txn, &instance_id))
            .await
    }

    /// Standalone convenience wrapper used by the client façade, which appends a single message
    /// outside of any dispatcher cycle and needs its own transaction.
    pub async fn append_message(&self, message: TaskMessage) -> Result<(), String> {
        let sessions = self.clone();
        self.store
            .transact(move |txn| sessions.append_message_in_txn(txn, message))
            .await
    }

    /// See `append_message_batch_in_txn`.
    pub async fn append_message_batch(&self, messages: Vec<TaskMessage>) -> Result<(), String> {
        if messages.is_empty() {
            return Ok(());
        }
        let sessions = self.clone();
        self.store
            .transact(move |txn| sessions.append_message_batch_in_txn(txn, messages))
            .await
    }

    pub async fn release_session(&self, instance_id: InstanceId) -> Result<(), String> {
        let sessions = self.clone();
        self.store
            .transact(move |txn| sessions.release_session_in_txn(txn, &instance_id))
            .await
    }

    /// Sweeps the store for sessions whose runtime state is already terminal and releases them.
    /// Run at boot alongside `boot_sweep`, to formalize the "terminal session garbage" ambiguity
    /// noted in the design notes: a crash between commit and release must not leave the session
    /// lingering forever.
    pub async fn release_terminal_sessions(&self) -> Result<usize, String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                let rows = txn.enumerate(&dict, EnumerateMode::Unordered)?;
                let mut released = 0;
                for (key, session) in rows {
                    if is_terminal_session(&session) {
                        txn.try_remove(&dict, &key)?;
                        released += 1;
                    }
                }
                trace!("Released {released} terminal sessions at boot");
                Ok(released)
            })
            .await
    }
}

/// A session's runtime state carries no separate "status" field (only the event sequence), so
/// terminality is read off the last event: the executor always appends one of these three as the
/// final event of a finished execution.
fn is_terminal_session(session: &PersistentSession) -> bool {
    matches!(
        session.runtime_state.last().map(|event| &event.kind),
        Some(model::HistoryEventKind::ExecutionCompleted { .. })
            | Some(model::HistoryEventKind::ExecutionFailed { .. })
            | Some(model::HistoryEventKind::ExecutionTerminated { .. })
    )
}

/// Exposed for `instance_store`/`dispatcher` callers that already have a `LockableTaskMessage`
/// and want to check its claim state without importing `model` themselves.
pub fn is_claimed(message: &LockableTaskMessage) -> bool {
    message.locked
}
