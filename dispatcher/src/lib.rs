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

//! The two dispatcher loops (C6, C7): fetch a unit of work, execute it via the caller-supplied
//! collaborator (the deterministic executor, or a user activity), and atomically commit the
//! resulting state changes.

mod activity;
mod orchestration;

pub use activity::ActivityDispatcher;
pub use orchestration::OrchestrationDispatcher;

/// Distinguishes the three retry policies in §7 of the error handling design, so the outer loop
/// can `match` on the kind of failure instead of parsing message text:
/// - `Transient` store errors retry the whole cycle after a 1s backoff.
/// - `Fatal` executor errors retry immediately (backoff 0s) -- a deterministic executor is
///   expected to be debugged, not endlessly retried, so an outer policy may choose to cap these.
/// - `Unsupported` features (`ContinueAsNew`) are fatal to the cycle and the session is left
///   locked until a restart's boot sweep clears it.
#[derive(Debug)]
pub enum DispatchError {
    Transient(String),
    Fatal(String),
    Unsupported(&'static str),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Transient(msg) => write!(f, "transient error: {msg}"),
            DispatchError::Fatal(msg) => write!(f, "fatal error: {msg}"),
            DispatchError::Unsupported(feature) => write!(f, "unsupported feature: {feature}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl DispatchError {
    /// The backoff the outer loop should sleep before its next cycle, per §7.
    pub fn backoff(&self) -> std::time::Duration {
        match self {
            DispatchError::Transient(_) => std::time::Duration::from_secs(1),
            DispatchError::Fatal(_) | DispatchError::Unsupported(_) => std::time::Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests;
