//! Data models for the test runner
//!
//! This module contains all data structures shared by the coordinator and
//! the worker processes.

mod failure;
mod test_result;
mod work;

pub use failure::{DiscoveryFailure, HookFailure, HookFailureKind, HookPhase, WorkerCrash};
pub use test_result::{ExecutionEvent, ItemOutcome, RunResult, Verdict};
pub use work::{
    CaseSpec, FixturePhase, GroupKind, ItemId, ItemKind, ItemRef, ModuleCollision, NodeRef, TaskTarget, WorkGroup,
    WorkItem, WorkNode, WorkTree, LOAD_FAILURE_NAME,
};
