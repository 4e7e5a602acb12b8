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

//! The timer scheduler (C4): buffers future-dated messages ordered by fire time, and releases
//! them back into their target session on expiry.
//!
//! Entries are keyed by a byte encoding of `(fire_at, target_instance, event_id)` chosen so that
//! LMDB's natural ascending-byte-order cursor iteration *is* the scheduler's required ordering
//! (`TimerEntry`'s `Ord` impl in `model` sorts the same way), with no separate index structure.

use std::sync::Arc;
use std::time::Duration;

use async_latch::AsyncLatch;
use chrono::{DateTime, Utc};
use log::debug;
use model::TimerEntry;
use sessions::Sessions;
use store::{Dict, EnumerateMode, Store, Txn};
use tokio::sync::Notify;

/// Reserved dictionary name for the timer scheduler, per the persisted state layout.
pub const DICTIONARY_NAME: &str = "Timer_Set";

/// How many fired entries a single wake cycle will drain before yielding back to the sleep loop.
const MAX_BATCH: usize = 256;

fn encode_sortable_i64(value: i64) -> [u8; 8] {
    // Flipping the sign bit maps the full i64 range onto an unsigned range with the same
    // ordering, so big-endian byte comparison (what LMDB's cursor uses) sorts correctly even
    // across the epoch.
    ((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes()
}

fn sort_key(entry: &TimerEntry) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + entry.target.target_instance.as_str().len() + 1 + 8);
    key.extend_from_slice(&encode_sortable_i64(
        entry.fire_at.timestamp_nanos_opt().unwrap_or(i64::MAX),
    ));
    key.extend_from_slice(entry.target.target_instance.as_str().as_bytes());
    key.push(0); // separator: instance ids never contain a NUL byte in practice, and a short
                 // instance id must sort before a longer one with the same prefix.
    key.extend_from_slice(&entry.target.event.event_id.to_be_bytes());
    key
}

#[derive(Clone)]
pub struct Timers {
    store: Store,
    dict: Dict<TimerEntry>,
    wake: Arc<Notify>,
}

impl Timers {
    pub fn new(store: Store) -> Result<Timers, String> {
        let dict = store.open_dictionary(DICTIONARY_NAME)?;
        Ok(Timers { store, dict, wake: Arc::new(Notify::new()) })
    }

    /// Within `txn`: inserts every entry, keyed for ordered retrieval.
    pub fn schedule_in_txn(&self, txn: &mut Txn<'_>, entries: Vec<TimerEntry>) -> Result<(), String> {
        for entry in entries {
            let key = sort_key(&entry);
            txn.set(&self.dict, &key, &entry)?;
        }
        Ok(())
    }

    /// Standalone convenience wrapper; also wakes the background loop early so a newly scheduled
    /// timer that fires sooner than the current sleep isn't missed until the next tick.
    pub async fn schedule(&self, entries: Vec<TimerEntry>) -> Result<(), String> {
        if entries.is_empty() {
            return Ok(());
        }
        let timers = self.clone();
        timers
            .store
            .transact(move |txn| timers.schedule_in_txn(txn, entries))
            .await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Within `txn`: removes and returns every entry with `fire_at <= now`, in ascending
    /// `fire_at` order, up to `max_batch` entries.
    pub fn pop_fired_in_txn(
        &self,
        txn: &mut Txn<'_>,
        now: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<Vec<TimerEntry>, String> {
        let rows = txn.enumerate(&self.dict, EnumerateMode::Ordered)?;
        let mut fired = Vec::new();
        for (key, entry) in rows {
            if entry.fire_at > now || fired.len() >= max_batch {
                break;
            }
            txn.try_remove(&self.dict, &key)?;
            fired.push(entry);
        }
        Ok(fired)
    }

    /// Wakes `run_loop` immediately, without waiting for its current sleep to elapse. Callers
    /// that schedule timer entries as part of a larger cross-component transaction (see
    /// `dispatcher`) call this after their commit succeeds, since `schedule_in_txn` alone cannot
    /// -- the wake must not fire until the entries are actually durable.
    pub fn wake_loop(&self) {
        self.wake.notify_one();
    }

    /// The duration until the earliest scheduled `fire_at`, or `None` if the scheduler is empty
    /// (callers should then wait on `schedule`'s wake signal rather than poll).
    pub async fn wake_delay(&self, now: DateTime<Utc>) -> Result<Option<Duration>, String> {
        let dict = self.dict.clone();
        let earliest = self
            .store
            .transact(move |txn| {
                let rows = txn.enumerate(&dict, EnumerateMode::Ordered)?;
                Ok(rows.into_iter().next().map(|(_, entry)| entry.fire_at))
            })
            .await?;
        Ok(earliest.map(|fire_at| {
            if fire_at <= now {
                Duration::ZERO
            } else {
                (fire_at - now).to_std().unwrap_or(Duration::ZERO)
            }
        }))
    }

    /// Drains every currently-fired entry into its target session's message queue, atomically
    /// (one timer-store-and-session-queue transaction per drained batch).
    async fn fire_due_entries(&self, sessions: &Sessions) -> Result<usize, String> {
        let timers = self.clone();
        let sessions = sessions.clone();
        timers
            .store
            .transact(move |txn| {
                let now = Utc::now();
                let fired = timers.pop_fired_in_txn(txn, now, MAX_BATCH)?;
                let count = fired.len();
                for entry in fired {
                    sessions.append_message_in_txn(txn, entry.target)?;
                }
                Ok(count)
            })
            .await
    }

    /// The background loop (§4.4): sleeps until the earliest `fire_at` (capped at `tick_cap`),
    /// then fires every due entry into its target session. Interruptible by `schedule` (which
    /// signals `wake`) and by `cancel`; never starts a fresh sleep after cancellation, but an
    /// in-flight fire-and-commit is allowed to finish.
    pub async fn run_loop(&self, sessions: &Sessions, cancel: &AsyncLatch, tick_cap: Duration) {
        loop {
            if cancel.poll_triggered() {
                return;
            }
            let delay = match self.wake_delay(Utc::now()).await {
                Ok(Some(d)) => d.min(tick_cap),
                Ok(None) => tick_cap,
                Err(e) => {
                    log::warn!("Error computing timer wake delay: {e}");
                    tick_cap
                }
            };
            tokio::select! {
                biased;
                () = cancel.triggered() => return,
                () = self.wake.notified() => {}
                () = tokio::time::sleep(delay) => {}
            }
            if cancel.poll_triggered() {
                return;
            }
            match self.fire_due_entries(sessions).await {
                Ok(0) => {}
                Ok(count) => debug!("Fired {count} timers"),
                Err(e) => log::warn!("Error firing due timers: {e}"),
            }
        }
    }

    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| Ok(txn.enumerate(&dict, EnumerateMode::Unordered)?.len()))
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests;
