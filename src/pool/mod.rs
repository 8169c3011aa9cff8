//! Worker pool
//!
//! A fixed number of long-lived worker processes pulling tasks from one
//! shared queue. Results stream back as [`PoolEvent`]s on a single channel;
//! each submission also gets a [`TaskHandle`] that resolves once the task is
//! settled one way or another.

mod process;
mod slot;

pub use process::{WorkerCommand, WorkerProcess};
pub use slot::SlotReport;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::{ExecutionEvent, HookFailure, ItemRef, TaskTarget, WorkerCrash};
use crate::protocol::{ProtocolError, WorkerSettings, WorkerTask};
use slot::{QueuedTask, Shared, Slot};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {index} failed to start: {reason}")]
    Handshake { index: usize, reason: String },

    #[error("worker {index} was not ready within {}s", timeout.as_secs())]
    StartupTimeout { index: usize, timeout: Duration },

    #[error("worker {index} did not finalize within {}s", timeout.as_secs())]
    ShutdownTimeout { index: usize, timeout: Duration },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("pool no longer accepts tasks")]
    Closed,
}

/// Everything the pool reports to its owner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    Execution(ExecutionEvent),
    HookFailed(HookFailure),
    WorkerCrashed(WorkerCrash),
    WorkerFault {
        worker_index: usize,
        job_id: Option<u64>,
        message: String,
    },
}

/// How a submitted task was settled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The worker reported every item and `task_done`
    Completed,
    /// The worker died or could not be started; missing outcomes were synthesized
    Crashed,
    /// Never dispatched because dispatch stopped
    Abandoned,
    /// Running when the pool was terminated
    Killed,
}

/// Ordered escalation; slots compare against it
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PoolSignal {
    Run,
    StopDispatch,
    Kill,
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub size: usize,
    pub command: WorkerCommand,
    /// Template; each worker gets its own `worker_index`
    pub settings: WorkerSettings,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub fn new(size: usize, command: WorkerCommand) -> Self {
        Self {
            size: size.max(1),
            command,
            settings: WorkerSettings::default(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

/// Submission receipt
#[derive(Debug)]
pub struct TaskHandle {
    pub job_id: u64,
    pub sequence_index: usize,
    pub items: Vec<ItemRef>,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the task to be settled
    pub async fn outcome(self) -> TaskOutcome {
        self.outcome.await.unwrap_or(TaskOutcome::Abandoned)
    }

    /// Settlement if it already happened
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TaskOutcome::Abandoned),
        }
    }
}

/// Totals over all slots, returned by [`WorkerPool::join`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub workers_spawned: usize,
    pub tasks_completed: usize,
    pub worker_crashes: usize,
    pub tasks_killed: usize,
    pub tasks_abandoned: usize,
}

impl PoolReport {
    fn absorb(&mut self, slot: SlotReport) {
        self.workers_spawned += slot.spawned;
        self.tasks_completed += slot.completed;
        self.worker_crashes += slot.crashes;
        self.tasks_killed += slot.killed;
    }
}

pub struct WorkerPool {
    sender: Option<mpsc::UnboundedSender<QueuedTask>>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueuedTask>>>,
    signal: watch::Sender<PoolSignal>,
    slots: Vec<JoinHandle<SlotReport>>,
    next_job_id: u64,
    next_sequence: usize,
}

impl WorkerPool {
    /// Start `config.size` workers. Only a failure to start the first one is fatal;
    /// the other slots start their workers in the background.
    pub async fn start(
        config: PoolConfig,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self, PoolError> {
        let size = config.size.max(1);
        info!("Starting {} worker(s)", size);

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(receiver));
        let (signal, signal_rx) = watch::channel(PoolSignal::Run);

        let first_settings = WorkerSettings {
            worker_index: 0,
            ..config.settings.clone()
        };
        let (first, initializer) = WorkerProcess::spawn(
            0,
            &config.command,
            first_settings,
            config.startup_timeout,
        )
        .await?;
        if let Some(failure) = initializer {
            let _ = events.send(PoolEvent::HookFailed(failure));
        }

        let shared = Arc::new(Shared {
            command: config.command,
            settings: config.settings,
            startup_timeout: config.startup_timeout,
            shutdown_timeout: config.shutdown_timeout,
            queue: Arc::clone(&queue),
            events,
        });

        let mut first = Some(first);
        let slots = (0..size)
            .map(|index| {
                let slot = Slot::new(index, Arc::clone(&shared), signal_rx.clone(), first.take());
                tokio::spawn(slot.run())
            })
            .collect();

        Ok(Self {
            sender: Some(sender),
            queue,
            signal,
            slots,
            next_job_id: 1,
            next_sequence: 0,
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Queue a task for the next free worker
    pub fn submit(&mut self, target: TaskTarget, items: Vec<ItemRef>) -> Result<TaskHandle, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        if *self.signal.borrow() != PoolSignal::Run {
            return Err(PoolError::Closed);
        }

        let task = WorkerTask {
            job_id: self.next_job_id,
            sequence_index: self.next_sequence,
            target,
            items,
        };
        let (reply, outcome) = oneshot::channel();
        let handle = TaskHandle {
            job_id: task.job_id,
            sequence_index: task.sequence_index,
            items: task.items.clone(),
            outcome,
        };
        sender
            .send(QueuedTask { task, reply })
            .map_err(|_| PoolError::Closed)?;

        self.next_job_id += 1;
        self.next_sequence += 1;
        Ok(handle)
    }

    /// No more submissions; workers shut down once the queue is empty
    pub fn close(&mut self) {
        self.sender.take();
    }

    /// Leave queued tasks undispatched; running tasks finish normally
    pub fn stop_dispatch(&self) {
        self.escalate(PoolSignal::StopDispatch);
    }

    /// Kill every worker now
    pub fn terminate(&self) {
        self.escalate(PoolSignal::Kill);
    }

    fn escalate(&self, level: PoolSignal) {
        self.signal.send_if_modified(|current| {
            if *current < level {
                *current = level;
                true
            } else {
                false
            }
        });
    }

    /// Wait for every slot to finish. Requires [`close`](Self::close),
    /// [`stop_dispatch`](Self::stop_dispatch) or [`terminate`](Self::terminate)
    /// first, otherwise slots keep waiting for work.
    pub async fn join(&mut self) -> PoolReport {
        let mut report = PoolReport::default();
        for handle in self.slots.drain(..) {
            match handle.await {
                Ok(slot) => report.absorb(slot),
                Err(e) => error!("Worker slot failed: {}", e),
            }
        }

        let mut queue = self.queue.lock().await;
        while let Ok(queued) = queue.try_recv() {
            let _ = queued.reply.send(TaskOutcome::Abandoned);
            report.tasks_abandoned += 1;
        }
        if report.tasks_abandoned > 0 {
            warn!("{} task(s) were never dispatched", report.tasks_abandoned);
        }
        info!(
            "Pool stopped: {} worker(s) spawned, {} crash(es)",
            report.workers_spawned, report.worker_crashes
        );
        report
    }

    pub async fn drain_and_stop(mut self) -> PoolReport {
        self.close();
        self.join().await
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            self.terminate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Verdict;
    use std::path::PathBuf;

    /// Minimal protocol speaker: `task_done` for every run, optionally after a delay
    fn scripted_worker(on_run: &str) -> WorkerCommand {
        scripted_worker_then(on_run, ":")
    }

    /// Like [`scripted_worker`], running `after_done` once `task_done` is out
    fn scripted_worker_then(on_run: &str, after_done: &str) -> WorkerCommand {
        let script = format!(
            r#"read cfg
echo '{{"type":"ready","pid":'$$'}}'
while read line; do
  case "$line" in
    *'"type":"shutdown"'*) echo '{{"type":"finalized"}}'; exit 0;;
    *'"type":"run"'*)
      id=$(printf '%s' "$line" | sed 's/.*"job_id":\([0-9]*\).*/\1/')
      {on_run}
      echo '{{"type":"task_done","job_id":'$id'}}'
      {after_done};;
  esac
done"#
        );
        WorkerCommand::with_args("sh", ["-c", script.as_str()])
    }

    fn target() -> TaskTarget {
        TaskTarget {
            suite: PathBuf::from("/suites/test_a.yaml"),
            module: "test_a".into(),
            path: vec![],
        }
    }

    fn collect(rx: &mut mpsc::UnboundedReceiver<PoolEvent>) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_fails_without_first_worker() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(2, WorkerCommand::new("/nonexistent/verdant"));
        let err = WorkerPool::start(config, tx).await.err().unwrap();
        assert!(matches!(err, PoolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_tasks_complete_and_ids_increase() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(2, scripted_worker(":"));
        let mut pool = WorkerPool::start(config, tx).await.unwrap();
        assert_eq!(pool.size(), 2);

        let handles: Vec<TaskHandle> = (0..4)
            .map(|_| pool.submit(target(), vec![]).unwrap())
            .collect();
        let ids: Vec<u64> = handles.iter().map(|h| h.job_id).collect();
        assert_eq!(ids, [1, 2, 3, 4]);
        assert_eq!(handles[3].sequence_index, 3);

        let report = pool.drain_and_stop().await;
        assert_eq!(report.tasks_completed, 4);
        for handle in handles {
            assert_eq!(handle.outcome().await, TaskOutcome::Completed);
        }
    }

    #[tokio::test]
    async fn test_crash_synthesizes_errors_and_respawns() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(1, scripted_worker("exit 9"));
        let mut pool = WorkerPool::start(config, tx).await.unwrap();

        let first = pool
            .submit(target(), vec![ItemRef::from_id("test_a.one"), ItemRef::from_id("test_a.two")])
            .unwrap();
        let second = pool.submit(target(), vec![ItemRef::from_id("test_a.three")]).unwrap();
        let report = pool.drain_and_stop().await;

        assert_eq!(first.outcome().await, TaskOutcome::Crashed);
        assert_eq!(second.outcome().await, TaskOutcome::Crashed);
        assert_eq!(report.worker_crashes, 2);
        assert!(report.workers_spawned >= 2);

        let events = collect(&mut rx);
        let crashes = events
            .iter()
            .filter(|e| matches!(e, PoolEvent::WorkerCrashed(_)))
            .count();
        assert_eq!(crashes, 2);
        let errors: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                PoolEvent::Execution(ExecutionEvent::Completed { outcome, .. }) => {
                    assert_eq!(outcome.verdict, Verdict::Error);
                    Some(outcome.item.id.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(errors, ["test_a.one", "test_a.two", "test_a.three"]);
    }

    #[tokio::test]
    async fn test_worker_dying_between_tasks_is_replaced() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(1, scripted_worker_then(":", "exit 0"));
        let mut pool = WorkerPool::start(config, tx).await.unwrap();

        let first = pool.submit(target(), vec![]).unwrap();
        assert_eq!(first.outcome().await, TaskOutcome::Completed);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let second = pool.submit(target(), vec![ItemRef::from_id("test_a.two")]).unwrap();
        assert_eq!(second.outcome().await, TaskOutcome::Completed);
        let report = pool.drain_and_stop().await;

        assert_eq!(report.worker_crashes, 0);
        assert_eq!(report.tasks_completed, 2);
        assert!(report.workers_spawned >= 2);
        let events = collect(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            PoolEvent::WorkerCrashed(_) | PoolEvent::Execution(ExecutionEvent::Completed { .. })
        )));
    }

    #[tokio::test]
    async fn test_stop_dispatch_abandons_queue() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(1, scripted_worker("sleep 0.5"));
        let mut pool = WorkerPool::start(config, tx).await.unwrap();

        let handles: Vec<TaskHandle> = (0..3)
            .map(|_| pool.submit(target(), vec![]).unwrap())
            .collect();
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.stop_dispatch();
        assert!(matches!(pool.submit(target(), vec![]), Err(PoolError::Closed)));

        let report = pool.join().await;
        assert_eq!(report.tasks_abandoned, 2);
        let outcomes: Vec<TaskOutcome> = futures::future::join_all(handles.into_iter().map(TaskHandle::outcome)).await;
        assert_eq!(
            outcomes,
            [TaskOutcome::Completed, TaskOutcome::Abandoned, TaskOutcome::Abandoned]
        );
    }

    #[tokio::test]
    async fn test_terminate_kills_running_task() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = PoolConfig::new(1, scripted_worker("sleep 30"));
        let mut pool = WorkerPool::start(config, tx).await.unwrap();

        let mut handle = pool.submit(target(), vec![]).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.terminate();
        let report = tokio::time::timeout(Duration::from_secs(10), pool.join())
            .await
            .unwrap();
        assert_eq!(report.tasks_killed, 1);
        assert_eq!(handle.try_outcome(), Some(TaskOutcome::Killed));
    }
}
