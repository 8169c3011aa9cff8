//! Run coordinator
//!
//! Discovers the targets, plans tasks, starts the pool and folds its event
//! stream into a [`RunResult`], honouring interrupts along the way.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::aggregate::Aggregator;
use super::interrupt::{Interrupts, RunState};
use super::plan::{plan_tasks, planned_items, NameFilter};
use crate::discovery::{Discoverer, DEFAULT_PATTERN};
use crate::hooks::{HookSpec, ResolverChain};
use crate::models::{ExecutionEvent, HookPhase, RunResult};
use crate::output::Reporter;
use crate::pool::{
    PoolConfig, PoolEvent, TaskHandle, TaskOutcome, WorkerCommand, WorkerPool,
    DEFAULT_STARTUP_TIMEOUT,
};
use crate::protocol::WorkerSettings;
use crate::utils::Timer;

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Upper bound on waiting for killed workers to be collected
const FORCED_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default coverage data location, relative to the base directory
pub const DEFAULT_COVERAGE_DIR: &str = ".verdant-coverage";

/// Number of worker processes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolSize {
    /// One per available CPU
    #[default]
    Auto,
    Fixed(usize),
}

impl PoolSize {
    pub fn resolve(self) -> usize {
        match self {
            PoolSize::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            PoolSize::Fixed(n) => n.max(1),
        }
    }
}

impl FromStr for PoolSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PoolSize::Auto);
        }
        match s.parse::<usize>() {
            Ok(0) => Err("process count must be at least 1".to_string()),
            Ok(n) => Ok(PoolSize::Fixed(n)),
            Err(_) => Err(format!("expected a number or 'auto', got '{s}'")),
        }
    }
}

impl fmt::Display for PoolSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolSize::Auto => write!(f, "auto"),
            PoolSize::Fixed(n) => write!(f, "{n}"),
        }
    }
}

impl Serialize for PoolSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PoolSize::Auto => serializer.serialize_str("auto"),
            PoolSize::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for PoolSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(usize),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => PoolSize::from_str(&n.to_string()),
            Repr::Text(s) => PoolSize::from_str(&s),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// Everything that shapes one run
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub pool_size: PoolSize,
    pub name_filter: Option<String>,
    pub allow_output_passthrough: bool,
    pub initializer: Option<String>,
    pub finalizer: Option<String>,
    pub coverage_enabled: bool,
    /// Defaults to [`DEFAULT_COVERAGE_DIR`] under the base directory
    pub coverage_dir: Option<PathBuf>,
    pub grace_period: Duration,
    pub discovery_pattern: String,
    pub search_paths: Vec<PathBuf>,
    pub base_dir: PathBuf,
    /// Defaults to this executable's `worker` subcommand
    pub worker_program: Option<WorkerCommand>,
    pub default_timeout_secs: Option<u64>,
    pub startup_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pool_size: PoolSize::Auto,
            name_filter: None,
            allow_output_passthrough: false,
            initializer: None,
            finalizer: None,
            coverage_enabled: false,
            coverage_dir: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            discovery_pattern: DEFAULT_PATTERN.to_string(),
            search_paths: Vec::new(),
            base_dir: PathBuf::from("."),
            worker_program: None,
            default_timeout_secs: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }
}

impl RunOptions {
    pub fn with_pool_size(mut self, size: PoolSize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_worker_program(mut self, command: WorkerCommand) -> Self {
        self.worker_program = Some(command);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.name_filter = Some(filter.into());
        self
    }
}

/// Owns one run from discovery to the final result
pub struct Coordinator {
    options: RunOptions,
    resolvers: ResolverChain,
    reporters: Vec<Box<dyn Reporter>>,
}

impl Coordinator {
    pub fn new(options: RunOptions) -> Self {
        Self {
            options,
            resolvers: ResolverChain::standard(),
            reporters: Vec::new(),
        }
    }

    pub fn with_resolvers(mut self, resolvers: ResolverChain) -> Self {
        self.resolvers = resolvers;
        self
    }

    pub fn with_reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run `targets` to completion or until interrupted
    pub async fn run(&mut self, targets: &[String], mut interrupts: Interrupts) -> Result<RunResult> {
        let timer = Timer::start("run");
        let mut aggregator = Aggregator::new(Utc::now());

        let discoverer = Discoverer::new(&self.options.base_dir, &self.options.discovery_pattern)
            .context("Failed to set up discovery")?
            .with_search_paths(self.options.search_paths.iter().cloned());
        let (tree, failures) = discoverer.discover_all(targets);
        for failure in failures {
            aggregator.discovery_failed(failure);
        }

        let filter = self
            .options
            .name_filter
            .as_deref()
            .map(NameFilter::new)
            .transpose()
            .context("Invalid name filter")?;
        let tasks = plan_tasks(&tree, filter.as_ref());
        if tasks.is_empty() {
            info!("No items to run");
            let mut result = aggregator.finish(timer.elapsed_ms(), false, 0);
            result.no_items_found = true;
            self.finished(&result);
            return Ok(result);
        }

        let settings = self.worker_settings(&mut aggregator);
        let size = self.options.pool_size.resolve().min(tasks.len());
        let command = match &self.options.worker_program {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe().context("Cannot locate the worker executable")?,
        };
        info!(
            "Running {} item(s) in {} task(s) on {} worker(s)",
            planned_items(&tasks),
            tasks.len(),
            size
        );

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let config = PoolConfig::new(size, command)
            .with_settings(settings)
            .with_startup_timeout(self.options.startup_timeout);
        let mut pool = WorkerPool::start(config, events_tx)
            .await
            .context("Failed to start worker pool")?;

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            handles.push(pool.submit(task.target, task.items)?);
        }
        pool.close();

        let mut state = RunState::Running;
        let mut grace_deadline: Option<Instant> = None;
        loop {
            let deadline = grace_deadline.unwrap_or_else(far_future);
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, &mut aggregator),
                    None => break,
                },
                _ = interrupts.recv(), if state != RunState::Finalized => {
                    state = state.escalate();
                    match state {
                        RunState::Draining => {
                            info!(
                                "Stopping dispatch; waiting up to {}s for running tasks",
                                self.options.grace_period.as_secs()
                            );
                            pool.stop_dispatch();
                            grace_deadline = Some(Instant::now() + self.options.grace_period);
                        }
                        _ => {
                            warn!("Second interrupt; terminating workers");
                            pool.terminate();
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if grace_deadline.is_some() => {
                    warn!("Grace period expired; terminating workers");
                    state = RunState::Finalized;
                    pool.terminate();
                    break;
                }
            }
        }

        let report = if state == RunState::Finalized {
            match tokio::time::timeout(FORCED_JOIN_TIMEOUT, pool.join()).await {
                Ok(report) => Some(report),
                Err(_) => {
                    error!("Workers did not stop within {}s", FORCED_JOIN_TIMEOUT.as_secs());
                    None
                }
            }
        } else {
            Some(pool.join().await)
        };
        while let Ok(event) = events.try_recv() {
            self.handle(event, &mut aggregator);
        }
        if let Some(report) = report {
            debug!("Pool report: {:?}", report);
        }

        let not_run = count_not_run(&mut handles, &aggregator);
        let result = aggregator.finish(timer.elapsed_ms(), state != RunState::Running, not_run);
        info!("{}", result);
        self.finished(&result);
        Ok(result)
    }

    fn worker_settings(&self, aggregator: &mut Aggregator) -> WorkerSettings {
        let mut resolve = |reference: Option<&String>, phase: HookPhase| -> Option<HookSpec> {
            let reference = reference?;
            match self.resolvers.resolve(reference, phase) {
                Ok(spec) => Some(spec),
                Err(failure) => {
                    warn!("{}", failure);
                    aggregator.hook_failed(failure);
                    None
                }
            }
        };
        let initializer = resolve(self.options.initializer.as_ref(), HookPhase::Initializer);
        let finalizer = resolve(self.options.finalizer.as_ref(), HookPhase::Finalizer);

        let coverage_dir = self.options.coverage_enabled.then(|| {
            let dir = self
                .options
                .coverage_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_COVERAGE_DIR));
            if dir.is_absolute() {
                dir
            } else {
                std::path::absolute(self.options.base_dir.join(&dir))
                    .unwrap_or_else(|_| self.options.base_dir.join(dir))
            }
        });

        WorkerSettings {
            worker_index: 0,
            initializer,
            finalizer,
            allow_output_passthrough: self.options.allow_output_passthrough,
            coverage_dir,
            default_timeout_secs: self.options.default_timeout_secs,
        }
    }

    fn handle(&mut self, event: PoolEvent, aggregator: &mut Aggregator) {
        match event {
            PoolEvent::Execution(ExecutionEvent::Started { item, .. }) => {
                if aggregator.started(&item) {
                    for reporter in &mut self.reporters {
                        reporter.on_started(&item, aggregator.result());
                    }
                }
            }
            PoolEvent::Execution(ExecutionEvent::Completed { outcome, .. }) => {
                let verdict = outcome.verdict;
                if aggregator.completed(outcome) {
                    let partial = aggregator.result();
                    if let Some(outcome) = partial.bucket(verdict).last() {
                        for reporter in &mut self.reporters {
                            reporter.on_completed(outcome, partial);
                        }
                    }
                }
            }
            PoolEvent::HookFailed(failure) => {
                warn!("{}", failure);
                aggregator.hook_failed(failure);
            }
            PoolEvent::WorkerCrashed(crash) => {
                error!("{}", crash);
                aggregator.worker_crashed(crash);
            }
            PoolEvent::WorkerFault {
                worker_index,
                job_id,
                message,
            } => {
                let message = match job_id {
                    Some(job_id) => format!("worker {worker_index}, job {job_id}: {message}"),
                    None => format!("worker {worker_index}: {message}"),
                };
                warn!("{}", message);
                aggregator.diagnostic(message);
            }
        }
    }

    fn finished(&mut self, result: &RunResult) {
        for reporter in &mut self.reporters {
            reporter.on_finished(result);
        }
    }
}

/// Items of tasks that never ran to the end and never started
fn count_not_run(handles: &mut [TaskHandle], aggregator: &Aggregator) -> usize {
    let mut not_run = 0;
    for handle in handles.iter_mut() {
        if matches!(
            handle.try_outcome(),
            Some(TaskOutcome::Completed | TaskOutcome::Crashed)
        ) {
            continue;
        }
        not_run += handle
            .items
            .iter()
            .filter(|item| !aggregator.is_completed(&item.id) && !aggregator.is_started(&item.id))
            .count();
    }
    not_run
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365)
}
