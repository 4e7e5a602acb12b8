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

//! The composition root: wires the eight components together, runs the boot sweep, and spawns
//! the background loops (dispatcher fan-out, timer scheduler, instance-store reaper) on a shared
//! `task_executor::Executor`.
//!
//! Not itself a component of the persistent core (§2); this crate only exists to own the process
//! lifecycle a production deployment needs, per §10.

mod config;

pub use config::EngineConfig;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use log::info;

use activities::Activities;
use async_latch::AsyncLatch;
use client::Client;
use dispatcher::{ActivityDispatcher, OrchestrationDispatcher};
use instance_store::InstanceStore;
use model::{ActivityRegistry, OrchestrationExecutor};
use sessions::Sessions;
use store::Store;
use task_executor::Executor;
use timers::Timers;

type BackgroundLoop = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A running engine: the opened store, every provider, and the background loops spawned at
/// start. Dropping this does not stop the loops -- call `shutdown` to do that in an orderly way.
pub struct Engine {
    executor: Executor,
    cancel: AsyncLatch,
    store: Store,
    sessions: Sessions,
    activities: Activities,
    instance_store: InstanceStore,
    loops: Vec<BackgroundLoop>,
}

impl Engine {
    /// Opens the store, runs the boot sweep (§5, §9: clears stale locks, releases sessions that
    /// reached a terminal state but never got released, e.g. after a crash between commit and
    /// release -- see "Ambiguity: terminal session garbage" in the design notes), then spawns
    /// every background loop the core needs: `max_concurrent_orchestrations` orchestration
    /// dispatcher workers, `max_concurrent_activities` activity dispatcher workers, the timer
    /// scheduler, and the archive reaper.
    pub async fn start(
        config: EngineConfig,
        executor: Executor,
        orchestration_executor: Arc<dyn OrchestrationExecutor>,
        activity_registry: Arc<dyn ActivityRegistry>,
    ) -> Result<Engine, String> {
        let level: log::LevelFilter = config
            .log_level
            .parse()
            .map_err(|_| format!("Invalid log_level {:?}", config.log_level))?;
        log::set_max_level(level);

        let store = Store::new(&config.store_path, config.store_max_size_bytes, 64, executor.clone())?;
        let sessions = Sessions::new(store.clone())?;
        let activities = Activities::new(store.clone()).await?;
        let timers = Timers::new(store.clone())?;
        let instance_store = InstanceStore::new(store.clone())?;

        let cleared_sessions = sessions.boot_sweep().await?;
        let cleared_activities = activities.boot_sweep().await?;
        let released = sessions.release_terminal_sessions().await?;
        info!(
            "Boot sweep: cleared {cleared_sessions} session locks, {cleared_activities} activity \
             locks, released {released} lingering terminal sessions"
        );

        let cancel = AsyncLatch::new();
        let mut loops: Vec<BackgroundLoop> = Vec::new();

        let orchestration_dispatcher = OrchestrationDispatcher::new(
            store.clone(),
            sessions.clone(),
            activities.clone(),
            timers.clone(),
            instance_store.clone(),
            orchestration_executor,
            config.receive_timeout,
        );
        for _ in 0..config.max_concurrent_orchestrations.max(1) {
            let dispatcher = orchestration_dispatcher.clone();
            let cancel = cancel.clone();
            loops.push(Box::pin(executor.spawn(
                async move { dispatcher.run_loop(&cancel).await },
                |e| log::error!("Orchestration dispatcher worker panicked: {e}"),
            )));
        }

        let activity_dispatcher = ActivityDispatcher::new(
            store.clone(),
            activities.clone(),
            sessions.clone(),
            activity_registry,
            config.receive_timeout,
        );
        for _ in 0..config.max_concurrent_activities.max(1) {
            let dispatcher = activity_dispatcher.clone();
            let cancel = cancel.clone();
            loops.push(Box::pin(executor.spawn(
                async move { dispatcher.run_loop(&cancel).await },
                |e| log::error!("Activity dispatcher worker panicked: {e}"),
            )));
        }

        {
            let timers = timers.clone();
            let sessions = sessions.clone();
            let cancel = cancel.clone();
            let tick_cap = config.timer_tick_cap;
            loops.push(Box::pin(executor.spawn(
                async move { timers.run_loop(&sessions, &cancel, tick_cap).await },
                |e| log::error!("Timer scheduler loop panicked: {e}"),
            )));
        }

        {
            let instance_store = instance_store.clone();
            let cancel = cancel.clone();
            let retention = ChronoDuration::from_std(config.archive_retention)
                .map_err(|e| format!("archive_retention out of range: {e}"))?;
            let initial_delay = config.reaper_initial_delay;
            let success_interval = config.reaper_success_interval;
            let failure_interval = config.reaper_failure_interval;
            loops.push(Box::pin(executor.spawn(
                async move {
                    instance_store
                        .run_reaper_loop(&cancel, initial_delay, success_interval, failure_interval, retention)
                        .await
                },
                |e| log::error!("Instance store reaper loop panicked: {e}"),
            )));
        }

        Ok(Engine {
            executor,
            cancel,
            store,
            sessions,
            activities,
            instance_store,
            loops,
        })
    }

    /// The external-caller surface (C8): start/query/wait/raise-event/terminate.
    pub fn client(&self) -> Client {
        Client::new(self.store.clone(), self.sessions.clone(), self.instance_store.clone())
    }

    /// Direct access to the activity queue, for hosts that want to inspect depth or wire their
    /// own metrics; not needed for the normal start/dispatch/complete flow, which runs entirely
    /// through the background loops spawned by `start`.
    pub fn activities(&self) -> &Activities {
        &self.activities
    }

    /// Triggers cancellation and awaits every background loop to finish its in-flight cycle
    /// (§5: "On role loss, all loops are cancelled and awaited before the replica gives up write
    /// status"). Consumes the engine: a shut-down `Engine` cannot be restarted, only dropped.
    pub async fn shutdown(self) {
        self.cancel.trigger();
        futures::future::join_all(self.loops).await;
    }

    /// The executor this engine's loops run on, exposed so a host embedding `Engine` inside a
    /// larger process can share it for unrelated work rather than spinning up a second runtime.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}
