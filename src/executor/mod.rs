//! Run orchestration
//!
//! Plans tasks from a discovered tree, drives the worker pool and aggregates
//! what comes back.

mod aggregate;
mod interrupt;
mod plan;
mod runner;

pub use aggregate::Aggregator;
pub use interrupt::{InterruptHandle, Interrupts, RunState};
pub use plan::{plan_tasks, planned_items, NameFilter, PlannedTask};
pub use runner::{
    Coordinator, PoolSize, RunOptions, DEFAULT_COVERAGE_DIR, DEFAULT_GRACE_PERIOD,
};
