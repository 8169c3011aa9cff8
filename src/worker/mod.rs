//! Worker process
//!
//! A worker is this binary started with the hidden `worker` subcommand. It
//! reads [`WorkerRequest`]s from stdin and answers with [`WorkerMessage`]s on
//! stdout. The lifecycle is:
//!
//! 1. `configure`: run the initializer, answer `ready`
//! 2. `run` (any number): execute the task, answer `started`/`completed` per
//!    item, then `task_done`
//! 3. `shutdown`: run the finalizer, answer `finalized`, exit
//!
//! A panic while executing a task is contained to that task: its unreported
//! items are reported as errors and the worker keeps accepting work.
//! Each case runs in a process group of its own.

mod command;
mod exec;
mod scope;

pub use command::{CommandOutput, ShellCommand, Termination};
pub use exec::{classify, execute_task, SKIP_EXIT_CODE};
pub use scope::TaskScope;

use anyhow::{bail, Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines};
use tracing::{debug, error, info, warn};

use crate::hooks::{HookContext, HookSpec};
use crate::models::{HookFailure, HookPhase, ItemId, ItemOutcome, ItemRef};
use crate::protocol::{
    self, decode, ProtocolError, WorkerMessage, WorkerRequest, WorkerSettings, WorkerTask,
};

/// Per-task event emitter
///
/// Guarantees a `started` before every `completed`, drops duplicate outcomes
/// and keeps track of which selected items still owe an outcome.
pub struct EventSink<W> {
    writer: W,
    pid: u32,
    job_id: Option<u64>,
    pending: Vec<ItemRef>,
    started: HashSet<ItemId>,
    completed: HashSet<ItemId>,
}

impl<W: AsyncWrite + Unpin> EventSink<W> {
    pub fn new(writer: W, pid: u32) -> Self {
        Self {
            writer,
            pid,
            job_id: None,
            pending: Vec::new(),
            started: HashSet::new(),
            completed: HashSet::new(),
        }
    }

    pub fn begin(&mut self, task: &WorkerTask) {
        self.job_id = Some(task.job_id);
        self.pending = task.items.clone();
        self.started.clear();
        self.completed.clear();
    }

    fn current_job(&self) -> u64 {
        self.job_id.unwrap_or_default()
    }

    pub async fn send(&mut self, message: &WorkerMessage) -> Result<(), ProtocolError> {
        protocol::send(&mut self.writer, message).await
    }

    pub async fn started(&mut self, item: &ItemRef) -> Result<(), ProtocolError> {
        if !self.started.insert(item.id.clone()) {
            return Ok(());
        }
        let message = WorkerMessage::Started {
            job_id: self.current_job(),
            item: item.clone(),
        };
        self.send(&message).await
    }

    pub async fn completed(&mut self, outcome: ItemOutcome) -> Result<(), ProtocolError> {
        if self.completed.contains(&outcome.item.id) {
            debug!("Dropping second outcome for {}", outcome.item);
            return Ok(());
        }
        self.started(&outcome.item).await?;

        let job_id = self.current_job();
        let item = outcome.item.clone();
        let message = WorkerMessage::Completed {
            job_id,
            outcome: outcome.on_worker(self.pid),
        };
        match protocol::encode(&message) {
            Ok(line) => protocol::write_line(&mut self.writer, &line).await?,
            Err(e) => {
                warn!("Cannot encode outcome of {}: {}", item, e);
                self.send(&WorkerMessage::Fault {
                    job_id: Some(job_id),
                    message: format!("outcome of {item} could not be encoded: {e}"),
                })
                .await?;
                let fallback = ItemOutcome::error(item.clone(), format!("unencodable outcome: {e}"))
                    .on_worker(self.pid);
                self.send(&WorkerMessage::Completed {
                    job_id,
                    outcome: fallback,
                })
                .await?;
            }
        }
        self.completed.insert(item.id);
        Ok(())
    }

    /// Selected items of the current task that have no outcome yet
    pub fn unreported(&self) -> Vec<ItemRef> {
        self.pending
            .iter()
            .filter(|item| !self.completed.contains(&item.id))
            .cloned()
            .collect()
    }

    /// Report an error for every item still owing an outcome
    pub async fn fail_unreported(&mut self, detail: &str) -> Result<(), ProtocolError> {
        for item in self.unreported() {
            self.completed(ItemOutcome::error(item, detail)).await?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Entry point of the `worker` subcommand
pub async fn run_worker() -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let sink = EventSink::new(tokio::io::stdout(), std::process::id());
    until_terminated(serve(stdin.lines(), sink)).await
}

/// SIGTERM abandons the current task. Dropping it kills the process group
/// of the case being run, which the pool's group kill would not reach.
#[cfg(unix)]
async fn until_terminated(served: impl Future<Output = Result<()>>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("cannot watch for SIGTERM")?;
    tokio::select! {
        done = served => done,
        _ = terminate.recv() => {
            warn!("Terminated; abandoning the current task");
            Ok(())
        }
    }
}

#[cfg(not(unix))]
async fn until_terminated(served: impl Future<Output = Result<()>>) -> Result<()> {
    served.await
}

async fn serve<R, W>(mut requests: Lines<R>, mut sink: EventSink<W>) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let pid = sink.pid;
    let settings = match next_request(&mut requests).await? {
        Some(WorkerRequest::Configure { settings }) => settings,
        Some(other) => bail!("expected a configure request first, got {other:?}"),
        None => {
            debug!("Task channel closed before configuration");
            return Ok(());
        }
    };
    info!(worker = settings.worker_index, pid, "Worker started");

    let initializer = invoke_hook(settings.initializer.as_ref(), HookPhase::Initializer, &settings).await;
    sink.send(&WorkerMessage::Ready { pid, initializer })
        .await
        .context("cannot report readiness")?;

    loop {
        match next_request(&mut requests).await {
            Ok(Some(WorkerRequest::Run { task })) => {
                debug!(job_id = task.job_id, "Running task {}", task.target);
                run_contained(&task, &settings, &mut sink).await?;
                sink.send(&WorkerMessage::TaskDone {
                    job_id: task.job_id,
                })
                .await?;
            }
            Ok(Some(WorkerRequest::Shutdown)) => {
                let finalizer =
                    invoke_hook(settings.finalizer.as_ref(), HookPhase::Finalizer, &settings).await;
                sink.send(&WorkerMessage::Finalized { finalizer }).await?;
                info!(worker = settings.worker_index, pid, "Worker finished");
                break;
            }
            Ok(Some(WorkerRequest::Configure { .. })) => {
                warn!("Ignoring repeated configure request");
            }
            Ok(None) => {
                warn!("Task channel closed without shutdown");
                break;
            }
            Err(ProtocolError::Decode { line, source }) => {
                warn!("Unreadable request: {}", source);
                sink.send(&WorkerMessage::Fault {
                    job_id: None,
                    message: format!("unreadable request: {source} (line: {line})"),
                })
                .await?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn next_request<R>(requests: &mut Lines<R>) -> Result<Option<WorkerRequest>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = requests.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return decode(&line).map(Some);
    }
    Ok(None)
}

/// Execute a task; a panic fails the task's unreported items instead of the worker
async fn run_contained<W>(
    task: &WorkerTask,
    settings: &WorkerSettings,
    sink: &mut EventSink<W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    sink.begin(task);
    let result = AssertUnwindSafe(execute_task(task, settings, sink))
        .catch_unwind()
        .await;
    match result {
        Ok(done) => done,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(job_id = task.job_id, "Task panicked: {}", message);
            sink.fail_unreported(&format!("worker fault: {message}"))
                .await
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn invoke_hook(
    hook: Option<&HookSpec>,
    phase: HookPhase,
    settings: &WorkerSettings,
) -> Option<HookFailure> {
    let hook = hook?;
    let ctx = HookContext {
        phase,
        worker_pid: std::process::id(),
        worker_index: settings.worker_index,
        coverage_dir: settings.coverage_dir.as_deref(),
    };
    match hook.invoke(&ctx).await {
        Ok(()) => None,
        Err(failure) => {
            warn!("{}", failure);
            Some(failure)
        }
    }
}
