//! Failure records that end up in a run result
//!
//! These never abort a run on their own; they are collected next to the
//! verdict buckets so reporters can show them.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const NO_ITEMS: &str = "no runnable items found";

/// A target, or part of one, that contributed nothing to the run
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("target '{target}': {reason}")]
pub struct DiscoveryFailure {
    pub target: String,
    #[serde(default = "no_items_reason")]
    pub reason: String,
}

fn no_items_reason() -> String {
    NO_ITEMS.to_string()
}

impl DiscoveryFailure {
    /// No discovery strategy produced any item for the target
    pub fn new(target: impl Into<String>) -> Self {
        Self::with_reason(target, NO_ITEMS)
    }

    pub fn with_reason(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Worker lifecycle point a hook runs at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookPhase {
    Initializer,
    Finalizer,
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::Initializer => write!(f, "initializer"),
            HookPhase::Finalizer => write!(f, "finalizer"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailureKind {
    /// The reference does not name any known hook
    Unresolved,
    /// The reference resolved to something that cannot run in this phase
    NotInvocable,
    /// The hook ran and failed
    Raised,
}

impl fmt::Display for HookFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookFailureKind::Unresolved => write!(f, "could not be resolved"),
            HookFailureKind::NotInvocable => write!(f, "is not invocable"),
            HookFailureKind::Raised => write!(f, "failed"),
        }
    }
}

/// Initializer or finalizer problem
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{phase} '{reference}' {kind}: {message}")]
pub struct HookFailure {
    pub phase: HookPhase,
    pub reference: String,
    pub kind: HookFailureKind,
    pub message: String,
    /// Worker the failure happened in; `None` when resolution failed up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
}

impl HookFailure {
    pub fn new(
        phase: HookPhase,
        reference: impl Into<String>,
        kind: HookFailureKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            reference: reference.into(),
            kind,
            message: message.into(),
            worker_pid: None,
        }
    }

    pub fn in_worker(mut self, pid: u32) -> Self {
        self.worker_pid = Some(pid);
        self
    }
}

/// A worker process went away in the middle of a task
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("worker {worker_index} (pid {pid}) crashed during job {job_id}: {status}")]
pub struct WorkerCrash {
    pub worker_index: usize,
    pub pid: u32,
    pub job_id: u64,
    /// How the process ended, as far as it could be observed
    pub status: String,
}
