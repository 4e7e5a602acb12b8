// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ExecutionId, InstanceId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    Pending,
    Running,
    Completed,
    ContinuedAsNew,
    Failed,
    Canceled,
    Terminated,
}

impl OrchestrationStatus {
    /// Terminal statuses are never revisited: the owning session is removed from the session
    /// store on release, and the instance state migrates to the cold archive on write.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrchestrationStatus::Pending | OrchestrationStatus::Running)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance: InstanceId,
    pub execution: ExecutionId,
    pub name: String,
    pub version: String,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub status: OrchestrationStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub size: usize,
    pub tags: BTreeMap<String, String>,
}

impl OrchestrationState {
    pub fn pending(
        instance: InstanceId,
        execution: ExecutionId,
        name: String,
        version: String,
        input: Option<Value>,
        tags: BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        OrchestrationState {
            instance,
            execution,
            name,
            version,
            input,
            output: None,
            status: OrchestrationStatus::Pending,
            created_at: now,
            completed_at: None,
            last_updated: now,
            size: 0,
            tags,
        }
    }
}
