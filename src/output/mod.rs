//! Output formatting module
//!
//! Streaming reporters and final result formats.

mod formatter;
mod progress;

pub use formatter::{write_result_to_file, OutputFormat, ResultFormatter};
pub use progress::ProgressReporter;

use crate::models::{ItemOutcome, ItemRef, RunResult};

/// Receives run progress as it happens
///
/// `partial` is the result aggregated so far.
pub trait Reporter: Send {
    fn on_started(&mut self, _item: &ItemRef, _partial: &RunResult) {}

    fn on_completed(&mut self, _outcome: &ItemOutcome, _partial: &RunResult) {}

    fn on_finished(&mut self, _result: &RunResult) {}
}
