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

//! The instance store (C5): the latest `OrchestrationState` per instance, plus time-bucketed
//! cold archives for terminal states and a background reaper that deletes buckets older than
//! the retention window.
//!
//! Three kinds of dictionary:
//! - `InstSt_Current` -- hot path, `(instance_id, execution_id) -> OrchestrationState`, holding
//!   only Pending/Running entries.
//! - `InstSt_ExecutionId` -- `instance_id -> execution_id`, the pointer to the most recent
//!   execution, updated whenever a state transitions to Pending.
//! - `InstSt_<yyyy-MM-dd-HH>` -- one dictionary per UTC hour, holding every terminal state
//!   committed during that hour.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};

use async_latch::AsyncLatch;
use model::{ExecutionId, InstanceId, OrchestrationState, OrchestrationStatus};
use store::{Dict, Store, Txn};

pub const HOT_DICTIONARY_NAME: &str = "InstSt_Current";
pub const LATEST_EXECUTION_DICTIONARY_NAME: &str = "InstSt_ExecutionId";
pub use store::COLD_ARCHIVE_PREFIX as ARCHIVE_PREFIX;

const DEFAULT_RETENTION: ChronoDuration = ChronoDuration::hours(24);

fn hot_key(instance: &InstanceId, execution: &ExecutionId) -> Vec<u8> {
    let mut key = instance.as_str().as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(execution.as_str().as_bytes());
    key
}

fn archive_bucket_name(at: DateTime<Utc>) -> String {
    format!("{}{}", ARCHIVE_PREFIX, at.format("%Y-%m-%d-%H"))
}

/// Parses an hourly archive bucket's name back into the UTC instant its window started at.
/// Returns `None` for names that aren't hour buckets (`InstSt_Current`, `InstSt_ExecutionId`).
fn parse_bucket_hour(name: &str) -> Option<DateTime<Utc>> {
    let suffix = name.strip_prefix(ARCHIVE_PREFIX)?;
    let naive = chrono::NaiveDateTime::parse_from_str(&format!("{suffix}:00:00"), "%Y-%m-%d-%H:%M:%S").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[derive(Clone)]
pub struct InstanceStore {
    store: Store,
    hot: Dict<OrchestrationState>,
    latest_execution: Dict<ExecutionId>,
}

impl InstanceStore {
    pub fn new(store: Store) -> Result<InstanceStore, String> {
        let hot = store.open_dictionary(HOT_DICTIONARY_NAME)?;
        let latest_execution = store.open_dictionary(LATEST_EXECUTION_DICTIONARY_NAME)?;
        Ok(InstanceStore { store, hot, latest_execution })
    }

    /// Writes every entity, following the write rule in §4.5: Pending/Running entities upsert the
    /// hot dictionary (and, if Pending, the latest-execution pointer); terminal entities move to
    /// the current-hour archive bucket and are removed from the hot dictionary.
    ///
    /// Opens the archive bucket (if any terminal entities are present) *before* starting the
    /// transaction that writes into it, per the read-your-own-write hazard documented in
    /// `store`: dictionary creation must not share a txn with its first write.
    pub async fn write_entities(&self, entities: Vec<OrchestrationState>) -> Result<(), String> {
        if entities.is_empty() {
            return Ok(());
        }
        let archive = self.open_archive_if_needed(&entities)?;
        let instance_store = self.clone();
        self.store
            .transact(move |txn| instance_store.write_entities_in_txn(txn, archive.as_ref(), entities))
            .await
    }

    /// Opens the current-hour archive bucket if `entities` contains any terminal state, so a
    /// caller composing a bigger cross-component transaction (the orchestration dispatcher) can
    /// do so before opening that transaction, per the read-your-own-write hazard.
    pub fn open_archive_if_needed(
        &self,
        entities: &[OrchestrationState],
    ) -> Result<Option<Dict<OrchestrationState>>, String> {
        if entities.iter().any(|s| s.status.is_terminal()) {
            Ok(Some(self.store.open_dictionary(&archive_bucket_name(Utc::now()))?))
        } else {
            Ok(None)
        }
    }

    /// The in-txn half of `write_entities`. `archive`, if any terminal entity is present, must
    /// already be open (see `write_entities` / `open_archive_if_needed`).
    pub fn write_entities_in_txn(
        &self,
        txn: &mut Txn<'_>,
        archive: Option<&Dict<OrchestrationState>>,
        entities: Vec<OrchestrationState>,
    ) -> Result<(), String> {
        for state in entities {
            let key = hot_key(&state.instance, &state.execution);
            if state.status.is_terminal() {
                let archive = archive.ok_or_else(|| {
                    format!(
                        "write_entities_in_txn called with a terminal state for {} but no archive dictionary open",
                        state.instance
                    )
                })?;
                txn.set(archive, &key, &state)?;
                txn.try_remove(&self.hot, &key)?;
            } else {
                if state.status == OrchestrationStatus::Pending {
                    txn.set(
                        &self.latest_execution,
                        state.instance.as_str().as_bytes(),
                        &state.execution,
                    )?;
                }
                txn.set(&self.hot, &key, &state)?;
            }
        }
        Ok(())
    }

    /// Looks up the most recent execution's state for `instance_id`, per the read rule in §4.5.
    /// Returns `None` if the instance was never started, or if its terminal state has aged out
    /// past the two-hour archive horizon.
    pub async fn get_state(&self, instance_id: &InstanceId) -> Result<Option<OrchestrationState>, String> {
        let Some(execution) = self.latest_execution_for(instance_id).await? else {
            return Ok(None);
        };
        self.get_state_for_execution(instance_id, &execution).await
    }

    /// Looks up a specific execution's state. Cross-execution history queries (enumerating every
    /// execution an instance has ever had) are an explicit non-goal; only the instance's current
    /// `ExecutionId` pointer and a caller-supplied one are servable.
    pub async fn get_state_for_execution(
        &self,
        instance_id: &InstanceId,
        execution_id: &ExecutionId,
    ) -> Result<Option<OrchestrationState>, String> {
        let key = hot_key(instance_id, execution_id);
        let hot = self.hot.clone();
        if let Some(state) = self.store.transact({
            let key = key.clone();
            move |txn| txn.try_get(&hot, &key)
        }).await? {
            return Ok(Some(state));
        }

        // Probe the current and previous hour's archive buckets -- at most two lookups, per the
        // archive horizon invariant. Results older than that are not surfaced.
        let now = Utc::now();
        for bucket_start in [now, now - ChronoDuration::hours(1)] {
            let name = archive_bucket_name(bucket_start);
            let Some(archive) = self.try_open_existing_archive(&name).await? else {
                continue;
            };
            let key = key.clone();
            if let Some(state) = self.store.transact(move |txn| txn.try_get(&archive, &key)).await? {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    async fn latest_execution_for(&self, instance_id: &InstanceId) -> Result<Option<ExecutionId>, String> {
        let dict = self.latest_execution.clone();
        let key = instance_id.as_str().as_bytes().to_vec();
        self.store.transact(move |txn| txn.try_get(&dict, &key)).await
    }

    /// Opens an archive bucket only if it has already been created by a prior write; does not
    /// create a new (empty) bucket on a pure read path. The existence check is a real LMDB
    /// listing (`Store::enumerate_dictionaries`), so a bucket created by a prior process before a
    /// restart is still found.
    async fn try_open_existing_archive(&self, name: &str) -> Result<Option<Dict<OrchestrationState>>, String> {
        if !self.store.enumerate_dictionaries().await?.iter().any(|n| n == name) {
            return Ok(None);
        }
        Ok(Some(self.store.open_dictionary(name)?))
    }

    /// The reaper (§4.5): enumerates dictionary names, parses the hour suffix of every archive
    /// bucket, and deletes those older than `retention`. Returns the number of buckets deleted.
    pub async fn reap_expired_archives(&self, retention: ChronoDuration) -> Result<usize, String> {
        let now = Utc::now();
        let mut deleted = 0;
        for name in self.store.enumerate_dictionaries().await? {
            let Some(bucket_start) = parse_bucket_hour(&name) else {
                continue;
            };
            // A hour bucket covers [bucket_start, bucket_start + 1h); it ages out `retention`
            // after its window closes.
            if now - (bucket_start + ChronoDuration::hours(1)) > retention {
                self.store.remove_dictionary(&name).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// The background reaper loop: waits `initial_delay`, then runs `reap_expired_archives`
    /// every `success_interval` after a successful pass or `failure_interval` after a failed one,
    /// until `cancel` fires.
    pub async fn run_reaper_loop(
        &self,
        cancel: &AsyncLatch,
        initial_delay: std::time::Duration,
        success_interval: std::time::Duration,
        failure_interval: std::time::Duration,
        retention: ChronoDuration,
    ) {
        tokio::select! {
            biased;
            () = cancel.triggered() => return,
            () = tokio::time::sleep(initial_delay) => {}
        }
        loop {
            if cancel.poll_triggered() {
                return;
            }
            let started = std::time::Instant::now();
            let next_delay = match self.reap_expired_archives(retention).await {
                Ok(count) => {
                    info!("Reaper deleted {count} expired instance archives in {:?}", started.elapsed());
                    success_interval
                }
                Err(e) => {
                    warn!("Reaper pass failed: {e}");
                    failure_interval
                }
            };
            tokio::select! {
                biased;
                () = cancel.triggered() => return,
                () = tokio::time::sleep(next_delay) => {}
            }
        }
    }
}
