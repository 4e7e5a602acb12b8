// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

// The two external collaborators this crate models but does not implement: the deterministic
// orchestration executor, and the user activity registry. See `PURPOSE & SCOPE` / non-goals.

use async_trait::async_trait;
use serde_json::Value;

use crate::{ExecutionId, HistoryEvent, InstanceId, OrchestrationState, TaskMessage};

/// The new events a single orchestration dispatcher cycle hands to the executor, alongside the
/// history accumulated so far. The executor is pure with respect to these inputs: it performs no
/// I/O and makes no non-deterministic choice.
///
/// `execution` is the instance's current execution id, as recorded by `C5.write_entities` when
/// the instance (or its most recent `ContinueAsNew`) started: since this core does not support
/// `ContinueAsNew`, it never changes for the life of an instance. The executor must echo it back
/// unchanged on `Transition::final_state` -- the dispatcher does not stamp or correct it before
/// writing, so a wrong value here would silently orphan the instance's hot-dictionary row.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkItem {
    pub instance: InstanceId,
    pub execution: ExecutionId,
    pub runtime_state: Vec<HistoryEvent>,
    pub new_messages: Vec<TaskMessage>,
}

/// Everything a single `OrchestrationExecutor::execute` invocation produces.
///
/// `continue_as_new` is carried through even though the core rejects it (`DispatchError::Unsupported`
/// in `dispatcher`), so that an executor implementation has somewhere to report the attempt.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Transition {
    pub new_runtime_state: Vec<HistoryEvent>,
    pub outbound_activity_msgs: Vec<TaskMessage>,
    pub orchestrator_msgs: Vec<TaskMessage>,
    pub timer_msgs: Vec<TaskMessage>,
    pub continue_as_new: bool,
    pub final_state: Option<OrchestrationState>,
}

/// The deterministic replay engine. Implemented by the host process; this crate only depends on
/// the trait so that the persistent core has no opinion on replay semantics.
#[async_trait]
pub trait OrchestrationExecutor: Send + Sync {
    async fn execute(&self, work_item: WorkItem) -> Result<Transition, String>;
}

/// A typed activity failure, distinct from an infrastructure error: the dispatcher turns this
/// into a `TaskFailed` history event rather than retrying or aborting the cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivityFailure {
    pub reason: String,
    pub details: Option<String>,
}

impl ActivityFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        ActivityFailure {
            reason: reason.into(),
            details: None,
        }
    }

    pub fn with_details(reason: impl Into<String>, details: impl Into<String>) -> Self {
        ActivityFailure {
            reason: reason.into(),
            details: Some(details.into()),
        }
    }
}

/// Resolves `(name, version)` to a runnable activity and invokes it. Implemented by the host
/// process: this crate only depends on the trait.
///
/// Returns `None` when `(name, version)` names no registered activity, distinctly from `Some(Err)`
/// (a registered activity that itself failed): the activity dispatcher turns a `None` into a
/// synthesized `TaskFailed{reason: "TypeMissing"}` response rather than treating it as the
/// activity's own typed failure.
#[async_trait]
pub trait ActivityRegistry: Send + Sync {
    async fn run(
        &self,
        name: &str,
        version: &str,
        input: Option<Value>,
    ) -> Option<Result<Option<Value>, ActivityFailure>>;
}
