// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

//! A transactional named-dictionary store (component C1 of the orchestration engine), backed by
//! a single LMDB environment with one sub-database per named dictionary.
//!
//! Higher layers (`sessions`, `activities`, `timers`, `instance_store`) never touch `lmdb`
//! directly: they open typed `Dict<V>` handles by name and read/write them inside a `transact`
//! closure, which runs on the shared `task_executor::Executor` the way `sharded_lmdb` runs its
//! blocking LMDB calls.
//!
//! Keys are raw bytes chosen by the caller. Callers that need LMDB's natural (lexicographic)
//! key ordering to mean something -- the timer scheduler orders by `(fire_at, tiebreak)` -- are
//! responsible for encoding a sortable byte key; this crate does not interpret keys.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use lmdb::{Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction, Transaction, WriteFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// How `Txn::enumerate` should traverse a dictionary's entries.
///
/// The LMDB backend always iterates a sub-database in ascending key-byte order, so `Ordered` and
/// `Unordered` produce the same sequence here; the distinction exists at the trait boundary (see
/// `PURPOSE & SCOPE`, substrate contract) because not every transactional K/V store guarantees
/// cheap ordered enumeration. Callers must not rely on order when they asked for `Unordered`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumerateMode {
    Ordered,
    Unordered,
}

/// A typed handle onto one named LMDB sub-database.
///
/// Cheap to clone (a `Database` is a `Copy` integer handle into the environment); carries no
/// connection to any particular `Txn`, so the same `Dict<V>` can be read and written from many
/// transactions over its lifetime.
pub struct Dict<V> {
    name: String,
    db: Database,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Clone for Dict<V> {
    fn clone(&self) -> Self {
        Dict {
            name: self.name.clone(),
            db: self.db,
            _marker: PhantomData,
        }
    }
}

impl<V> Dict<V> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A single ACID transaction spanning every dictionary opened against the owning `Store`.
///
/// Obtained only via `Store::transact`, which commits on `Ok` and aborts (by dropping the
/// underlying LMDB transaction) on `Err`. There is no standalone `begin_transaction`/`commit`
/// pair exposed to callers: tying the transaction's lifetime to a closure is what lets this crate
/// keep `RwTransaction`'s environment-borrowing lifetime off the async call stack, matching how
/// `sharded_lmdb` keeps every `lmdb::Transaction` inside a `spawn_blocking` closure.
pub struct Txn<'env> {
    rw: RwTransaction<'env>,
}

impl<'env> Txn<'env> {
    pub fn try_get<V: DeserializeOwned>(&self, dict: &Dict<V>, key: &[u8]) -> Result<Option<V>, String> {
        match self.rw.get(dict.db, &key) {
            Ok(bytes) => bincode::deserialize(bytes)
                .map(Some)
                .map_err(|e| format!("Error deserializing value from dictionary {}: {e}", dict.name)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(format!("Error reading from dictionary {}: {e}", dict.name)),
        }
    }

    pub fn set<V: Serialize>(&mut self, dict: &Dict<V>, key: &[u8], value: &V) -> Result<(), String> {
        let bytes = bincode::serialize(value)
            .map_err(|e| format!("Error serializing value for dictionary {}: {e}", dict.name))?;
        self.rw
            .put(dict.db, &key, &bytes, WriteFlags::empty())
            .map_err(|e| format!("Error writing to dictionary {}: {e}", dict.name))
    }

    /// Reads the current value (or `default` if absent), applies `merge`, and writes the result
    /// back -- all within this transaction, so the read-modify-write is atomic with respect to
    /// every other write the transaction makes.
    pub fn add_or_update<V, F>(
        &mut self,
        dict: &Dict<V>,
        key: &[u8],
        default: V,
        merge: F,
    ) -> Result<(), String>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(V) -> V,
    {
        let current = self.try_get(dict, key)?.unwrap_or(default);
        let next = merge(current);
        self.set(dict, key, &next)
    }

    /// Returns whether a row was actually removed.
    pub fn try_remove<V>(&mut self, dict: &Dict<V>, key: &[u8]) -> Result<bool, String> {
        match self.rw.del(dict.db, &key, None) {
            Ok(()) => Ok(true),
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(format!("Error removing from dictionary {}: {e}", dict.name)),
        }
    }

    /// Enumerates every entry currently visible to this transaction.
    ///
    /// Per the substrate contract (`PURPOSE & SCOPE` §4.1), an enumeration opened inside a txn
    /// may not observe writes made earlier in the *same* txn: callers must not append to a
    /// dictionary and then enumerate it expecting to see the new row before commit. LMDB cursors
    /// do not actually enforce this (they would see the write), but code in this workspace is
    /// written as though they don't, to stay portable to stores that do enforce it.
    pub fn enumerate<V: DeserializeOwned>(
        &self,
        dict: &Dict<V>,
        _mode: EnumerateMode,
    ) -> Result<Vec<(Vec<u8>, V)>, String> {
        let mut cursor = self
            .rw
            .open_ro_cursor(dict.db)
            .map_err(|e| format!("Error opening cursor on dictionary {}: {e}", dict.name))?;
        let mut out = Vec::new();
        for entry in cursor.iter() {
            let (key, bytes) =
                entry.map_err(|e| format!("Error advancing cursor on dictionary {}: {e}", dict.name))?;
            let value = bincode::deserialize(bytes)
                .map_err(|e| format!("Error deserializing value from dictionary {}: {e}", dict.name))?;
            out.push((key.to_vec(), value));
        }
        Ok(out)
    }
}

/// Names of the store's reserved dictionaries, shared with `instance_store`'s archive enumeration.
pub const COLD_ARCHIVE_PREFIX: &str = "InstSt_";

struct Inner {
    env: Environment,
    executor: task_executor::Executor,
}

/// The transactional store abstraction (C1): a single LMDB environment, named dictionaries as
/// sub-databases, and closure-scoped transactions that span every dictionary the environment
/// has opened.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    /// Opens (creating if necessary) an LMDB environment at `path`, sized to hold up to
    /// `max_size_bytes` across all of its dictionaries, with room for `max_dbs` named
    /// dictionaries. All blocking LMDB work is dispatched through `executor`.
    pub fn new(
        path: &Path,
        max_size_bytes: usize,
        max_dbs: u32,
        executor: task_executor::Executor,
    ) -> Result<Store, String> {
        std::fs::create_dir_all(path)
            .map_err(|e| format!("Error making directory for store at {path:?}: {e}"))?;
        let env = Environment::new()
            // Matches sharded_lmdb: this store is not a write-once content-addressed cache, but
            // every durable transition it records is also reconstructable by replaying history,
            // so the same durability/throughput tradeoff applies.
            .set_flags(EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_TLS)
            .set_max_dbs(max_dbs)
            .set_map_size(max_size_bytes)
            .open(path)
            .map_err(|e| format!("Error opening store environment at {path:?}: {e}"))?;
        Ok(Store {
            inner: Arc::new(Inner { env, executor }),
        })
    }

    /// Idempotent get-or-create of a named dictionary. Safe to call repeatedly, including
    /// concurrently with a `transact` call on a different dictionary.
    pub fn open_dictionary<V>(&self, name: &str) -> Result<Dict<V>, String> {
        let db = self
            .inner
            .env
            .create_db(Some(name), DatabaseFlags::empty())
            .map_err(|e| format!("Error opening dictionary {name}: {e}"))?;
        Ok(Dict {
            name: name.to_string(),
            db,
            _marker: PhantomData,
        })
    }

    /// Durably deletes a named dictionary and all of its entries. Runs its own transaction,
    /// deliberately not composable with a caller-supplied `transact` closure: dropping a database
    /// while other handles reference it is only safe between transactions.
    pub async fn remove_dictionary(&self, name: &str) -> Result<(), String> {
        let store = self.clone();
        let name = name.to_string();
        self.inner
            .executor
            .spawn_blocking(
                move || {
                    let db = store
                        .inner
                        .env
                        .create_db(Some(&name), DatabaseFlags::empty())
                        .map_err(|e| format!("Error opening dictionary {name} for removal: {e}"))?;
                    let mut txn = store
                        .inner
                        .env
                        .begin_rw_txn()
                        .map_err(|e| format!("Error beginning transaction to remove dictionary {name}: {e}"))?;
                    // `drop_database` deletes the sub-database itself, not just its rows.
                    unsafe { txn.drop_database(db) }
                        .map_err(|e| format!("Error dropping dictionary {name}: {e}"))?;
                    txn.commit()
                        .map_err(|e| format!("Error committing removal of dictionary {name}: {e}"))?;
                    Ok(())
                },
                |e| Err(format!("`remove_dictionary` task failed: {e}")),
            )
            .await
    }

    /// Names of every named dictionary that currently exists in this environment, read straight
    /// off LMDB's own unnamed root database (which indexes every named sub-database by name) --
    /// not a count this crate keeps in memory, so it reflects dictionaries created by a prior
    /// process as faithfully as ones opened by this one. Used by `instance_store`'s reaper and
    /// archive lookups to find cold archive buckets by name prefix.
    pub async fn enumerate_dictionaries(&self) -> Result<Vec<String>, String> {
        let store = self.clone();
        self.inner
            .executor
            .spawn_blocking(
                move || {
                    let root = store
                        .inner
                        .env
                        .open_db(None)
                        .map_err(|e| format!("Error opening root database: {e}"))?;
                    let txn = store
                        .inner
                        .env
                        .begin_ro_txn()
                        .map_err(|e| format!("Error beginning transaction to enumerate dictionaries: {e}"))?;
                    let mut cursor = txn
                        .open_ro_cursor(root)
                        .map_err(|e| format!("Error opening cursor on root database: {e}"))?;
                    let mut names = Vec::new();
                    for entry in cursor.iter() {
                        let (key, _) =
                            entry.map_err(|e| format!("Error advancing cursor on root database: {e}"))?;
                        names.push(String::from_utf8_lossy(key).into_owned());
                    }
                    Ok(names)
                },
                |e| Err(format!("`enumerate_dictionaries` task failed: {e}")),
            )
            .await
    }

    /// Runs `f` inside a single read-write transaction spanning every dictionary opened against
    /// this store. Commits if `f` returns `Ok`; aborts (no durable effect) if `f` returns `Err`.
    pub async fn transact<F, T>(&self, f: F) -> Result<T, String>
    where
        F: for<'env> FnOnce(&mut Txn<'env>) -> Result<T, String> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        self.inner
            .executor
            .spawn_blocking(
                move || {
                    let rw = store
                        .inner
                        .env
                        .begin_rw_txn()
                        .map_err(|e| format!("Error beginning transaction: {e}"))?;
                    let mut txn = Txn { rw };
                    match f(&mut txn) {
                        Ok(value) => {
                            txn.rw
                                .commit()
                                .map_err(|e| format!("Error committing transaction: {e}"))?;
                            Ok(value)
                        }
                        Err(e) => Err(e),
                    }
                },
                |e| Err(format!("`transact` task failed: {e}")),
            )
            .await
    }
}

#[cfg(test)]
mod tests;
