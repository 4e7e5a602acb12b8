// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TaskMessage;

/// A future-dated message buffered by the timer scheduler.
///
/// Ordered by `(fire_at, target_instance, event_id)`: ties on `fire_at` break deterministically
/// on the lexicographically-earlier target instance, then the lower event id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerEntry {
    pub fire_at: DateTime<Utc>,
    pub target: TaskMessage,
}

impl TimerEntry {
    pub fn new(fire_at: DateTime<Utc>, target: TaskMessage) -> Self {
        TimerEntry { fire_at, target }
    }

    fn sort_key(&self) -> (DateTime<Utc>, &str, u64) {
        (
            self.fire_at,
            self.target.target_instance.as_str(),
            self.target.event.event_id,
        )
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}
