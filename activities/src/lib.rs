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

//! The activity queue (C3): an append-ordered-but-not-strict persistent queue of outbound
//! `TaskMessage`s awaiting execution, with lock-and-complete semantics.
//!
//! Entries are keyed by a monotonic `u64` assigned on append (see the "activity queue key"
//! ambiguity note: the original assigns a fresh id per dequeue and never persists it, which
//! leaves `complete_work_item` unable to remove the exact row it dequeued; this crate instead
//! keys each entry durably, so completion is unambiguous even under concurrent dispatcher
//! fan-out).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use model::TaskMessage;
use serde::{Deserialize, Serialize};
use store::{Dict, EnumerateMode, Store, Txn};

/// Reserved dictionary name for the activity queue, per the persisted state layout.
pub const DICTIONARY_NAME: &str = "Act_Queue";

const POLL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ActivityEntry {
    key: u64,
    message: TaskMessage,
    locked: bool,
}

/// A work item dequeued by `get_next_work_item`: the claimed message, plus the opaque key needed
/// to `complete_work_item` or `abandon_work_item` it later.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    key: u64,
    pub message: TaskMessage,
}

fn key_bytes(key: u64) -> [u8; 8] {
    key.to_be_bytes()
}

#[derive(Clone)]
pub struct Activities {
    store: Store,
    dict: Dict<ActivityEntry>,
    next_key: std::sync::Arc<AtomicU64>,
}

impl Activities {
    /// Opens the activity queue, seeding the in-memory monotonic key counter from the highest
    /// key already present so that a restart never reissues a key still in use.
    pub async fn new(store: Store) -> Result<Activities, String> {
        let dict: Dict<ActivityEntry> = store.open_dictionary(DICTIONARY_NAME)?;
        let scan_dict = dict.clone();
        let max_key = store
            .transact(move |txn| {
                let rows = txn.enumerate(&scan_dict, EnumerateMode::Unordered)?;
                Ok(rows.iter().map(|(_, entry)| entry.key).max().unwrap_or(0))
            })
            .await?;
        Ok(Activities {
            store,
            dict,
            next_key: std::sync::Arc::new(AtomicU64::new(max_key.wrapping_add(1))),
        })
    }

    /// Clears `locked` on every entry. Run once at boot: an owner that crashed mid-activity
    /// leaves its claimed entry locked forever otherwise.
    pub async fn boot_sweep(&self) -> Result<usize, String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                let rows = txn.enumerate(&dict, EnumerateMode::Unordered)?;
                let mut cleared = 0;
                for (key, mut entry) in rows {
                    if entry.locked {
                        entry.locked = false;
                        txn.set(&dict, &key, &entry)?;
                        cleared += 1;
                    }
                }
                Ok(cleared)
            })
            .await
    }

    /// Within `txn`: appends each message as a fresh, unlocked entry with a freshly minted key.
    pub fn append_batch_in_txn(&self, txn: &mut Txn<'_>, messages: Vec<TaskMessage>) -> Result<(), String> {
        for message in messages {
            let key = self.next_key.fetch_add(1, Ordering::SeqCst);
            let entry = ActivityEntry { key, message, locked: false };
            txn.set(&self.dict, &key_bytes(key), &entry)?;
        }
        Ok(())
    }

    /// Standalone convenience wrapper: opens its own transaction.
    pub async fn append_batch(&self, messages: Vec<TaskMessage>) -> Result<(), String> {
        if messages.is_empty() {
            return Ok(());
        }
        let activities = self.clone();
        self.store
            .transact(move |txn| activities.append_batch_in_txn(txn, messages))
            .await
    }

    /// Polls for the first unlocked entry (append order is preserved but not strictly enforced
    /// under concurrent fan-out, per the component contract), flips its lock, and returns it.
    /// Returns `None` after `receive_timeout` elapses.
    pub async fn get_next_work_item(&self, receive_timeout: Duration) -> Option<WorkItem> {
        let deadline = tokio::time::Instant::now() + receive_timeout;
        loop {
            match self.try_claim_one().await {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {}
                Err(e) => log::warn!("Error scanning the activity queue: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_BACKOFF).await;
        }
    }

    async fn try_claim_one(&self) -> Result<Option<WorkItem>, String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                let mut rows = txn.enumerate(&dict, EnumerateMode::Ordered)?;
                rows.sort_by_key(|(_, entry)| entry.key);
                for (row_key, mut entry) in rows {
                    if !entry.locked {
                        entry.locked = true;
                        txn.set(&dict, &row_key, &entry)?;
                        return Ok(Some(WorkItem { key: entry.key, message: entry.message }));
                    }
                }
                Ok(None)
            })
            .await
    }

    /// Within `txn`: removes the exact row the caller dequeued.
    pub fn complete_work_item_in_txn(&self, txn: &mut Txn<'_>, item: &WorkItem) -> Result<(), String> {
        txn.try_remove(&self.dict, &key_bytes(item.key))?;
        Ok(())
    }

    /// Standalone convenience wrapper: opens its own transaction.
    pub async fn complete_work_item(&self, item: WorkItem) -> Result<(), String> {
        let activities = self.clone();
        self.store
            .transact(move |txn| activities.complete_work_item_in_txn(txn, &item))
            .await
    }

    /// Clears the lock outside of any transaction, making the entry visible again: used when an
    /// activity dispatcher worker fails for infrastructure reasons rather than a typed activity
    /// failure (which instead becomes a `TaskFailed` response event).
    pub async fn abandon_work_item(&self, item: WorkItem) -> Result<(), String> {
        let dict = self.dict.clone();
        self.store
            .transact(move |txn| {
                if let Some(mut entry) = txn.try_get(&dict, &key_bytes(item.key))? {
                    entry.locked = false;
                    txn.set(&dict, &key_bytes(item.key), &entry)?;
                }
                Ok(())
            })
            .await
    }
}
