// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use serde::{Deserialize, Serialize};

use crate::{HistoryEvent, InstanceId};

/// An envelope addressed to a target instance's session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub target_instance: InstanceId,
    pub event: HistoryEvent,
}

impl TaskMessage {
    pub fn new(target_instance: InstanceId, event: HistoryEvent) -> Self {
        TaskMessage {
            target_instance,
            event,
        }
    }
}

/// A `TaskMessage` plus the lock bit that hides it from subsequent `accept_session` scans once
/// claimed by a dispatcher cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LockableTaskMessage {
    pub message: TaskMessage,
    pub locked: bool,
}

impl LockableTaskMessage {
    pub fn unlocked(message: TaskMessage) -> Self {
        LockableTaskMessage {
            message,
            locked: false,
        }
    }
}

/// The durable per-instance container of runtime state and inbound messages.
///
/// An immutable value type: every mutator below takes `self` by reference and returns a new
/// `PersistentSession`, mirroring invariant 2 in the data model (messages are never re-ordered
/// once appended) by always appending rather than mutating in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistentSession {
    pub session_id: InstanceId,
    pub runtime_state: Vec<HistoryEvent>,
    pub messages: Vec<LockableTaskMessage>,
    pub locked: bool,
}

impl PersistentSession {
    /// A fresh session for `session_id`, with no history and no messages.
    pub fn new(session_id: InstanceId) -> Self {
        PersistentSession {
            session_id,
            runtime_state: Vec::new(),
            messages: Vec::new(),
            locked: false,
        }
    }

    /// Appends `message` to the end of the queue, preserving append order. Does not touch the
    /// lock bit: a session may receive new messages while locked by a dispatcher cycle, to be
    /// observed on the next `accept_session`.
    pub fn with_message_appended(&self, message: TaskMessage) -> Self {
        let mut next = self.clone();
        next.messages.push(LockableTaskMessage::unlocked(message));
        next
    }

    /// Flips `locked` to `true` and returns the indices of every currently-unlocked message,
    /// which become "in-flight" for the claiming dispatcher cycle. Errors if already locked:
    /// callers are expected to have already filtered to unlocked sessions.
    pub fn with_claimed(&self) -> Result<(Self, Vec<TaskMessage>), String> {
        if self.locked {
            return Err(format!(
                "session {} is already locked",
                self.session_id.as_str()
            ));
        }
        let mut next = self.clone();
        next.locked = true;
        let mut claimed = Vec::new();
        for entry in &mut next.messages {
            if !entry.locked {
                entry.locked = true;
                claimed.push(entry.message.clone());
            }
        }
        Ok((next, claimed))
    }

    /// Replaces `runtime_state`, drops every message that was locked (claimed) by the cycle being
    /// completed, and clears the lock bit. Messages that arrived after the claim (still unlocked)
    /// are retained for the next cycle.
    pub fn with_transition_applied(&self, new_runtime_state: Vec<HistoryEvent>) -> Self {
        let mut next = self.clone();
        next.runtime_state = new_runtime_state;
        next.messages.retain(|m| !m.locked);
        next.locked = false;
        next
    }

    pub fn is_empty_of_pending_messages(&self) -> bool {
        self.messages.iter().all(|m| m.locked)
    }

    pub fn has_claimable_messages(&self) -> bool {
        !self.locked && self.messages.iter().any(|m| !m.locked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::HistoryEventKind;

    fn msg(n: u64) -> TaskMessage {
        TaskMessage::new(
            InstanceId::new("i1"),
            HistoryEvent::new(n, HistoryEventKind::EventRaised { name: "x".into(), input: None }),
        )
    }

    #[test]
    fn claim_hides_messages_from_a_second_claim() {
        let session = PersistentSession::new(InstanceId::new("i1"))
            .with_message_appended(msg(0))
            .with_message_appended(msg(1));

        let (claimed_session, claimed) = session.with_claimed().unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed_session.locked);
        assert!(!claimed_session.has_claimable_messages());

        // A second claim attempt on the already-locked session is rejected.
        assert!(claimed_session.with_claimed().is_err());
    }

    #[test]
    fn append_order_is_preserved_across_claims() {
        let session = PersistentSession::new(InstanceId::new("i1"))
            .with_message_appended(msg(0))
            .with_message_appended(msg(1))
            .with_message_appended(msg(2));

        let (_, claimed) = session.with_claimed().unwrap();
        let ids: Vec<u64> = claimed.iter().map(|m| m.event.event_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn transition_drops_claimed_messages_but_keeps_late_arrivals() {
        let session = PersistentSession::new(InstanceId::new("i1")).with_message_appended(msg(0));
        let (claimed_session, _claimed) = session.with_claimed().unwrap();

        // A message arrives mid-cycle, after the claim.
        let with_late_arrival = claimed_session.with_message_appended(msg(1));

        let completed = with_late_arrival.with_transition_applied(vec![]);
        assert!(!completed.locked);
        assert_eq!(completed.messages.len(), 1);
        assert_eq!(completed.messages[0].message.event.event_id, 1);
        assert!(!completed.messages[0].locked);
    }
}
