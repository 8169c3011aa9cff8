//! Worker slot: one long-lived worker and the loop feeding it tasks
//!
//! A slot pulls tasks from the shared queue until the queue closes or the
//! pool tells it to stop. When its worker dies mid-task the slot fills in the
//! missing outcomes, reports the crash and starts a replacement. A worker
//! found dead between tasks is replaced without blaming the next task.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

use super::process::{WorkerCommand, WorkerProcess};
use super::{PoolEvent, PoolSignal, TaskOutcome};
use crate::models::{ExecutionEvent, ItemId, ItemOutcome, ItemRef, WorkerCrash};
use crate::protocol::{ProtocolError, WorkerMessage, WorkerRequest, WorkerSettings, WorkerTask};

pub(crate) struct QueuedTask {
    pub task: WorkerTask,
    pub reply: oneshot::Sender<TaskOutcome>,
}

/// State every slot of a pool reads
pub(crate) struct Shared {
    pub command: WorkerCommand,
    pub settings: WorkerSettings,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub queue: Arc<Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    pub events: mpsc::UnboundedSender<PoolEvent>,
}

/// What one slot did over its lifetime
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotReport {
    pub spawned: usize,
    pub completed: usize,
    pub crashes: usize,
    pub killed: usize,
}

pub(crate) struct Slot {
    index: usize,
    shared: Arc<Shared>,
    signal: watch::Receiver<PoolSignal>,
    worker: Option<WorkerProcess>,
    report: SlotReport,
}

/// Which items of a task the worker has reported on
#[derive(Clone, Default)]
struct Progress {
    started: Vec<ItemRef>,
    completed: HashSet<ItemId>,
}

impl Progress {
    fn in_flight(&self) -> Option<&ItemRef> {
        self.started
            .iter()
            .rev()
            .find(|item| !self.completed.contains(&item.id))
    }
}

enum TaskEnd {
    Done,
    Broken(String),
}

impl Slot {
    pub fn new(
        index: usize,
        shared: Arc<Shared>,
        signal: watch::Receiver<PoolSignal>,
        worker: Option<WorkerProcess>,
    ) -> Self {
        let spawned = usize::from(worker.is_some());
        Self {
            index,
            shared,
            signal,
            worker,
            report: SlotReport {
                spawned,
                ..SlotReport::default()
            },
        }
    }

    pub async fn run(mut self) -> SlotReport {
        if self.worker.is_none() {
            self.worker = self.spawn().await;
        }

        while let Some(queued) = self.next_task().await {
            let outcome = self.execute(&queued.task).await;
            let _ = queued.reply.send(outcome);
            if outcome == TaskOutcome::Killed {
                break;
            }
        }

        self.finish().await;
        debug!(slot = self.index, "Slot finished: {:?}", self.report);
        self.report
    }

    async fn next_task(&mut self) -> Option<QueuedTask> {
        let queue = Arc::clone(&self.shared.queue);
        tokio::select! {
            biased;
            _ = wait_for_signal(&mut self.signal, PoolSignal::StopDispatch) => None,
            task = async move { queue.lock().await.recv().await } => task,
        }
    }

    async fn spawn(&mut self) -> Option<WorkerProcess> {
        let settings = WorkerSettings {
            worker_index: self.index,
            ..self.shared.settings.clone()
        };
        let spawned = WorkerProcess::spawn(
            self.index,
            &self.shared.command,
            settings,
            self.shared.startup_timeout,
        )
        .await;

        match spawned {
            Ok((worker, initializer)) => {
                if let Some(failure) = initializer {
                    self.emit(PoolEvent::HookFailed(failure));
                }
                self.report.spawned += 1;
                Some(worker)
            }
            Err(e) => {
                error!(slot = self.index, "Cannot start worker: {}", e);
                self.emit(PoolEvent::WorkerFault {
                    worker_index: self.index,
                    job_id: None,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    async fn execute(&mut self, task: &WorkerTask) -> TaskOutcome {
        self.replace_if_exited();
        if self.worker.is_none() {
            self.worker = self.spawn().await;
        }
        let Some(worker) = self.worker.as_mut() else {
            self.fill_missing(task, &Progress::default(), "not run: no worker available");
            return TaskOutcome::Crashed;
        };

        let mut progress = Progress::default();
        let ended = tokio::select! {
            biased;
            _ = wait_for_signal(&mut self.signal, PoolSignal::Kill) => None,
            end = drive(worker, task, &mut progress, &self.shared.events) => Some(end),
        };

        match ended {
            Some(TaskEnd::Done) => {
                self.report.completed += 1;
                TaskOutcome::Completed
            }
            Some(TaskEnd::Broken(reason)) => {
                self.recover(task, &progress, reason).await;
                TaskOutcome::Crashed
            }
            None => {
                if let Some(mut worker) = self.worker.take() {
                    info!(slot = self.index, pid = worker.pid(), "Killing worker");
                    worker.kill().await;
                }
                self.report.killed += 1;
                TaskOutcome::Killed
            }
        }
    }

    /// Drop a worker that died while idle so the next task gets a fresh one
    /// instead of being charged with the crash
    fn replace_if_exited(&mut self) {
        let Some(status) = self.worker.as_mut().and_then(WorkerProcess::exited) else {
            return;
        };
        let pid = self.worker.take().map(|w| w.pid()).unwrap_or_default();
        warn!(slot = self.index, pid, "Worker exited while idle: {}", status);
        self.emit(PoolEvent::WorkerFault {
            worker_index: self.index,
            job_id: None,
            message: format!("worker {pid} exited while idle: {status}"),
        });
    }

    async fn recover(&mut self, task: &WorkerTask, progress: &Progress, reason: String) {
        let (pid, status) = match self.worker.take() {
            Some(mut worker) => (worker.pid(), worker.reap().await),
            None => (0, "unknown".to_string()),
        };
        warn!(
            slot = self.index,
            pid,
            job_id = task.job_id,
            "Worker crashed ({}): {}",
            reason,
            status
        );
        self.report.crashes += 1;
        self.emit(PoolEvent::WorkerCrashed(WorkerCrash {
            worker_index: self.index,
            pid,
            job_id: task.job_id,
            status,
        }));

        let mut progress = progress.clone();
        if let Some(item) = progress.in_flight().cloned() {
            progress.completed.insert(item.id.clone());
            self.complete(
                task.job_id,
                ItemOutcome::error(item, "worker crashed while running"),
            );
        }
        self.fill_missing(task, &progress, "not run: worker crashed");

        if !self.stopping() {
            self.worker = self.spawn().await;
        }
    }

    /// Synthesize outcomes for every task item without one
    fn fill_missing(&self, task: &WorkerTask, progress: &Progress, detail: &str) {
        let started: HashSet<&str> = progress.started.iter().map(|i| i.id.as_str()).collect();
        for item in &task.items {
            if progress.completed.contains(&item.id) {
                continue;
            }
            if !started.contains(item.id.as_str()) {
                self.emit(PoolEvent::Execution(ExecutionEvent::Started {
                    job_id: task.job_id,
                    item: item.clone(),
                }));
            }
            self.complete(task.job_id, ItemOutcome::error(item.clone(), detail));
        }
    }

    fn complete(&self, job_id: u64, outcome: ItemOutcome) {
        self.emit(PoolEvent::Execution(ExecutionEvent::Completed { job_id, outcome }));
    }

    fn emit(&self, event: PoolEvent) {
        if self.shared.events.send(event).is_err() {
            debug!(slot = self.index, "Event receiver is gone");
        }
    }

    fn stopping(&self) -> bool {
        *self.signal.borrow() >= PoolSignal::StopDispatch
    }

    async fn finish(&mut self) {
        self.replace_if_exited();
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        let timeout = self.shared.shutdown_timeout;
        let finished = tokio::select! {
            biased;
            _ = wait_for_signal(&mut self.signal, PoolSignal::Kill) => None,
            result = worker.shutdown(timeout) => Some(result),
        };
        match finished {
            Some(Ok(None)) => {}
            Some(Ok(Some(failure))) => self.emit(PoolEvent::HookFailed(failure)),
            Some(Err(e)) => {
                warn!(slot = self.index, "Worker shutdown failed: {}", e);
                self.emit(PoolEvent::WorkerFault {
                    worker_index: self.index,
                    job_id: None,
                    message: e.to_string(),
                });
                worker.kill().await;
            }
            None => worker.kill().await,
        }
    }
}

/// Send one task and relay its events until `task_done` or a broken channel
async fn drive(
    worker: &mut WorkerProcess,
    task: &WorkerTask,
    progress: &mut Progress,
    events: &mpsc::UnboundedSender<PoolEvent>,
) -> TaskEnd {
    let emit = |event: PoolEvent| {
        let _ = events.send(event);
    };

    if let Err(e) = worker
        .send(&WorkerRequest::Run { task: task.clone() })
        .await
    {
        return TaskEnd::Broken(format!("cannot send task: {e}"));
    }

    loop {
        match worker.next_message().await {
            Ok(Some(WorkerMessage::Started { job_id, item })) if job_id == task.job_id => {
                progress.started.push(item.clone());
                emit(PoolEvent::Execution(ExecutionEvent::Started { job_id, item }));
            }
            Ok(Some(WorkerMessage::Completed { job_id, outcome })) if job_id == task.job_id => {
                progress.completed.insert(outcome.item.id.clone());
                emit(PoolEvent::Execution(ExecutionEvent::Completed { job_id, outcome }));
            }
            Ok(Some(WorkerMessage::TaskDone { job_id })) if job_id == task.job_id => {
                return TaskEnd::Done;
            }
            Ok(Some(WorkerMessage::Fault { job_id, message })) => {
                emit(PoolEvent::WorkerFault {
                    worker_index: worker.index(),
                    job_id,
                    message,
                });
            }
            Ok(Some(other)) => {
                warn!(worker = worker.index(), "Unexpected message for job {}: {:?}", task.job_id, other);
            }
            Ok(None) => return TaskEnd::Broken("channel closed".to_string()),
            Err(ProtocolError::Decode { line, .. }) => {
                warn!(worker = worker.index(), "Stray output on protocol channel: {}", line);
            }
            Err(e) => return TaskEnd::Broken(e.to_string()),
        }
    }
}

/// Resolves once the pool signal reaches `level`; never resolves if the pool is gone
async fn wait_for_signal(signal: &mut watch::Receiver<PoolSignal>, level: PoolSignal) {
    loop {
        if *signal.borrow_and_update() >= level {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_is_last_unfinished_start() {
        let mut progress = Progress::default();
        progress.started.push(ItemRef::from_id("m.a"));
        progress.started.push(ItemRef::from_id("m.b"));
        progress.completed.insert("m.a".to_string());
        assert_eq!(progress.in_flight().map(|i| i.id.as_str()), Some("m.b"));

        progress.completed.insert("m.b".to_string());
        assert!(progress.in_flight().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_signal_levels() {
        let (tx, mut rx) = watch::channel(PoolSignal::Run);
        tx.send_replace(PoolSignal::StopDispatch);
        // stop-dispatch satisfies a stop-dispatch wait but not a kill wait
        wait_for_signal(&mut rx, PoolSignal::StopDispatch).await;
        let kill_wait = tokio::time::timeout(
            Duration::from_millis(50),
            wait_for_signal(&mut rx, PoolSignal::Kill),
        )
        .await;
        assert!(kill_wait.is_err());

        tx.send_replace(PoolSignal::Kill);
        wait_for_signal(&mut rx, PoolSignal::StopDispatch).await;
    }
}
