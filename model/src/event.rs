// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::InstanceId;

/// A single entry in an execution's runtime history.
///
/// `event_id` is the event's sequence number within its execution's history; most variants also
/// carry `task_scheduled_id`, the `event_id` of the `TaskScheduled`/timer-creating event they
/// correlate with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: u64,
    pub kind: HistoryEventKind,
}

impl HistoryEvent {
    pub fn new(event_id: u64, kind: HistoryEventKind) -> Self {
        HistoryEvent { event_id, kind }
    }

    /// The `fire_at` of a `TimerCreated`/`TimerFired` event, if this is one.
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            HistoryEventKind::TimerCreated { fire_at } | HistoryEventKind::TimerFired { fire_at } => {
                Some(*fire_at)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryEventKind {
    ExecutionStarted {
        name: String,
        version: String,
        input: Option<Value>,
    },
    ExecutionCompleted {
        output: Option<Value>,
    },
    ExecutionFailed {
        reason: String,
        details: Option<String>,
    },
    /// Added alongside the distilled spec's variant list: the client façade's
    /// `terminate_instance` needs a terminal event distinct from a failure or a natural
    /// completion. Modeled the same way `ExecutionFailed` is.
    ExecutionTerminated {
        reason: String,
    },
    TaskScheduled {
        name: String,
        version: String,
        input: Option<Value>,
    },
    TaskCompleted {
        task_scheduled_id: u64,
        output: Option<Value>,
    },
    TaskFailed {
        task_scheduled_id: u64,
        reason: String,
        details: Option<String>,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        fire_at: DateTime<Utc>,
    },
    SubOrchestrationInstanceCreated {
        task_scheduled_id: u64,
        name: String,
        version: String,
        instance: InstanceId,
        input: Option<Value>,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: u64,
        output: Option<Value>,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: u64,
        reason: String,
        details: Option<String>,
    },
    SubOrchestrationInstanceStartFailed {
        task_scheduled_id: u64,
        cause: String,
    },
    EventRaised {
        name: String,
        input: Option<Value>,
    },
}
