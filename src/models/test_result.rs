//! Test result models
//!
//! Verdicts, per-item outcomes, the execution event stream and the final
//! bucketed run result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::failure::{DiscoveryFailure, HookFailure, WorkerCrash};
use super::work::{ItemId, ItemRef};

/// Terminal classification of an item
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    Error,
    Skipped,
    ExpectedFailure,
    UnexpectedSuccess,
}

impl Verdict {
    pub fn symbol(&self) -> &'static str {
        match self {
            Verdict::Passed => ".",
            Verdict::Failed => "F",
            Verdict::Error => "E",
            Verdict::Skipped => "s",
            Verdict::ExpectedFailure => "x",
            Verdict::UnexpectedSuccess => "u",
        }
    }

    /// Verdicts that make a run unsuccessful
    pub fn is_problem(&self) -> bool {
        matches!(self, Verdict::Failed | Verdict::Error)
    }

    pub fn all() -> [Verdict; 6] {
        [
            Verdict::Passed,
            Verdict::Failed,
            Verdict::Error,
            Verdict::Skipped,
            Verdict::ExpectedFailure,
            Verdict::UnexpectedSuccess,
        ]
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "PASS"),
            Verdict::Failed => write!(f, "FAIL"),
            Verdict::Error => write!(f, "ERROR"),
            Verdict::Skipped => write!(f, "SKIP"),
            Verdict::ExpectedFailure => write!(f, "XFAIL"),
            Verdict::UnexpectedSuccess => write!(f, "XPASS"),
        }
    }
}

/// Result of running one item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item: ItemRef,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_pid: Option<u32>,
}

impl ItemOutcome {
    pub fn new(item: ItemRef, verdict: Verdict) -> Self {
        Self {
            item,
            verdict,
            detail: None,
            duration_ms: 0,
            stdout: String::new(),
            stderr: String::new(),
            worker_pid: None,
        }
    }

    pub fn passed(item: ItemRef, duration_ms: u64) -> Self {
        Self::new(item, Verdict::Passed).with_duration(duration_ms)
    }

    pub fn failed(item: ItemRef, detail: impl Into<String>) -> Self {
        Self::new(item, Verdict::Failed).with_detail(detail)
    }

    pub fn error(item: ItemRef, detail: impl Into<String>) -> Self {
        Self::new(item, Verdict::Error).with_detail(detail)
    }

    pub fn skipped(item: ItemRef, reason: impl Into<String>) -> Self {
        Self::new(item, Verdict::Skipped).with_detail(reason)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn on_worker(mut self, pid: u32) -> Self {
        self.worker_pid = Some(pid);
        self
    }
}

impl fmt::Display for ItemOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}ms]", self.verdict, self.item, self.duration_ms)?;
        if let Some(detail) = &self.detail {
            write!(f, " - {detail}")?;
        }
        Ok(())
    }
}

/// Progress reported for a dispatched item
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Started { job_id: u64, item: ItemRef },
    Completed { job_id: u64, outcome: ItemOutcome },
}

impl ExecutionEvent {
    pub fn job_id(&self) -> u64 {
        match self {
            ExecutionEvent::Started { job_id, .. } | ExecutionEvent::Completed { job_id, .. } => {
                *job_id
            }
        }
    }

    pub fn item(&self) -> &ItemRef {
        match self {
            ExecutionEvent::Started { item, .. } => item,
            ExecutionEvent::Completed { outcome, .. } => &outcome.item,
        }
    }
}

/// Final aggregation of a run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub passing: Vec<ItemOutcome>,
    pub failures: Vec<ItemOutcome>,
    pub errors: Vec<ItemOutcome>,
    pub skipped: Vec<ItemOutcome>,
    pub expected_failures: Vec<ItemOutcome>,
    pub unexpected_successes: Vec<ItemOutcome>,

    /// Items that reached a verdict; fixture entries are not counted
    pub tests_run: usize,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,

    pub no_items_found: bool,
    pub interrupted: bool,
    /// Started but never completed when the run was forced to stop
    pub unfinished: Vec<ItemId>,
    /// Planned items that were never dispatched
    pub not_run: usize,

    pub discovery_failures: Vec<DiscoveryFailure>,
    pub hook_failures: Vec<HookFailure>,
    pub worker_crashes: Vec<WorkerCrash>,
    pub diagnostics: Vec<String>,
}

impl RunResult {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            passing: Vec::new(),
            failures: Vec::new(),
            errors: Vec::new(),
            skipped: Vec::new(),
            expected_failures: Vec::new(),
            unexpected_successes: Vec::new(),
            tests_run: 0,
            started_at,
            elapsed_ms: 0,
            no_items_found: false,
            interrupted: false,
            unfinished: Vec::new(),
            not_run: 0,
            discovery_failures: Vec::new(),
            hook_failures: Vec::new(),
            worker_crashes: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn bucket(&self, verdict: Verdict) -> &[ItemOutcome] {
        match verdict {
            Verdict::Passed => &self.passing,
            Verdict::Failed => &self.failures,
            Verdict::Error => &self.errors,
            Verdict::Skipped => &self.skipped,
            Verdict::ExpectedFailure => &self.expected_failures,
            Verdict::UnexpectedSuccess => &self.unexpected_successes,
        }
    }

    pub(crate) fn bucket_mut(&mut self, verdict: Verdict) -> &mut Vec<ItemOutcome> {
        match verdict {
            Verdict::Passed => &mut self.passing,
            Verdict::Failed => &mut self.failures,
            Verdict::Error => &mut self.errors,
            Verdict::Skipped => &mut self.skipped,
            Verdict::ExpectedFailure => &mut self.expected_failures,
            Verdict::UnexpectedSuccess => &mut self.unexpected_successes,
        }
    }

    /// Every outcome, bucket by bucket
    pub fn outcomes(&self) -> impl Iterator<Item = &ItemOutcome> {
        Verdict::all()
            .into_iter()
            .flat_map(move |verdict| self.bucket(verdict).iter())
    }

    pub fn outcome(&self, id: &str) -> Option<&ItemOutcome> {
        self.outcomes().find(|o| o.item.id == id)
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.bucket(verdict).len()
    }

    pub fn was_successful(&self) -> bool {
        self.tests_run > 0
            && !self.interrupted
            && self.failures.is_empty()
            && self.errors.is_empty()
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ran {} in {:.3}s | Pass: {} | Fail: {} | Error: {} | Skip: {} | XFail: {} | XPass: {}",
            self.tests_run,
            self.elapsed_ms as f64 / 1000.0,
            self.passing.len(),
            self.failures.len(),
            self.errors.len(),
            self.skipped.len(),
            self.expected_failures.len(),
            self.unexpected_successes.len()
        )
    }
}
