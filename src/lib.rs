//! verdant - parallel, process-isolated test execution
//!
//! Test items are discovered from YAML suite files, planned into tasks and
//! run on a pool of worker processes. Each worker is this same binary started
//! with the hidden `worker` subcommand, talking newline-delimited JSON over
//! its stdin and stdout.
//!
//! ## Layout
//!
//! - [`discovery`]: targets to a tree of groups and items
//! - [`executor`]: planning, the run coordinator, interrupts and aggregation
//! - [`pool`]: worker processes, crash recovery and task dispatch
//! - [`worker`]: the worker side of the protocol and item execution
//! - [`protocol`]: messages exchanged between the two
//! - [`hooks`]: per-worker initializer and finalizer hooks
//! - [`output`]: streaming reporters and result formats

pub mod cli;
pub mod config;
pub mod discovery;
pub mod executor;
pub mod hooks;
pub mod models;
pub mod output;
pub mod pool;
pub mod protocol;
pub mod utils;
pub mod worker;
