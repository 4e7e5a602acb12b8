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

//! Shared data model for the durable task orchestration engine.
//!
//! These types are intentionally free of any store or dispatcher concerns: they are the wire
//! format exchanged between the persistent core (`sessions`, `activities`, `timers`,
//! `instance_store`, `dispatcher`) and the two external collaborators this crate does not
//! implement: the deterministic orchestration executor, and user activity code.

mod event;
mod executor;
mod session;
mod state;
mod timer;

pub use event::{HistoryEvent, HistoryEventKind};
pub use executor::{
    ActivityFailure, ActivityRegistry, OrchestrationExecutor, Transition, WorkItem,
};
pub use session::{LockableTaskMessage, PersistentSession, TaskMessage};
pub use state::{OrchestrationState, OrchestrationStatus};
pub use timer::TimerEntry;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of an orchestration instance, unique across the cluster partition.
///
/// Opaque to the engine: callers choose it, or `client` generates one with a UUID.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        InstanceId(id.into())
    }

    pub fn generate() -> Self {
        InstanceId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        InstanceId(s)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        InstanceId(s.to_string())
    }
}

/// Identifier of a single execution of an instance. A new execution is started per
/// `ContinueAsNew`, which the core does not yet support (see `dispatcher::DispatchError::Unsupported`).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        ExecutionId(id.into())
    }

    pub fn generate() -> Self {
        ExecutionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
