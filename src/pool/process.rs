//! One worker child process and its two pipes

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

#[cfg(unix)]
use nix::sys::signal::Signal;

use super::PoolError;
use crate::models::HookFailure;
use crate::protocol::{self, decode, ProtocolError, WorkerMessage, WorkerRequest, WorkerSettings};
#[cfg(unix)]
use crate::utils::process::{kill_group, signal_group};

/// How long a crashed or stopping worker gets to exit on its own
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a terminated worker gets to kill its running case
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Program and arguments that start a worker
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// `<program> worker`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![OsString::from("worker")],
            env: Vec::new(),
        }
    }

    /// The running binary, re-entered through its worker subcommand
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Any program, started with exactly `args`
    #[cfg(test)]
    pub(crate) fn with_args<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // terminal interrupts go to the coordinator only
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

/// A started, configured worker
#[derive(Debug)]
pub struct WorkerProcess {
    index: usize,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl WorkerProcess {
    /// Spawn, configure and wait for the worker to report ready.
    /// A failed initializer does not fail the spawn; it is handed back.
    pub async fn spawn(
        index: usize,
        command: &WorkerCommand,
        settings: WorkerSettings,
        startup_timeout: Duration,
    ) -> Result<(Self, Option<HookFailure>), PoolError> {
        let mut child = command.build().spawn().map_err(|source| PoolError::Spawn {
            program: command.program().display().to_string(),
            source,
        })?;

        let handshake = |reason: &str| PoolError::Handshake {
            index,
            reason: reason.to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(|| handshake("stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| handshake("stdout not captured"))?;
        let pid = child.id().unwrap_or_default();

        let mut worker = Self {
            index,
            pid,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        };
        debug!(worker = index, pid, "Spawned worker");

        let ready = async {
            worker.send(&WorkerRequest::Configure { settings }).await?;
            worker.await_ready().await
        };
        let result = tokio::time::timeout(startup_timeout, ready).await;
        match result {
            Ok(Ok(initializer)) => Ok((worker, initializer)),
            Ok(Err(e)) => {
                worker.kill().await;
                Err(e)
            }
            Err(_) => {
                worker.kill().await;
                Err(PoolError::StartupTimeout {
                    index,
                    timeout: startup_timeout,
                })
            }
        }
    }

    async fn await_ready(&mut self) -> Result<Option<HookFailure>, PoolError> {
        loop {
            match self.next_message().await {
                Ok(Some(WorkerMessage::Ready { initializer, .. })) => return Ok(initializer),
                Ok(Some(other)) => debug!(worker = self.index, "Ignoring {:?} before ready", other),
                Ok(None) => {
                    return Err(PoolError::Handshake {
                        index: self.index,
                        reason: "worker exited before it was ready".to_string(),
                    })
                }
                Err(ProtocolError::Decode { line, .. }) => {
                    warn!(worker = self.index, "Stray output on protocol channel: {}", line)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn send(&mut self, request: &WorkerRequest) -> Result<(), ProtocolError> {
        match self.stdin.as_mut() {
            Some(stdin) => protocol::send(stdin, request).await,
            None => Err(ProtocolError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "task channel already closed",
            ))),
        }
    }

    /// Next message; `None` once the worker's stdout is closed
    pub async fn next_message(&mut self) -> Result<Option<WorkerMessage>, ProtocolError> {
        while let Some(line) = self.stdout.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return decode(&line).map(Some);
        }
        Ok(None)
    }

    /// Send the sentinel and wait for the finalizer's report and the exit
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<Option<HookFailure>, PoolError> {
        self.send(&WorkerRequest::Shutdown).await?;
        let finalized = tokio::time::timeout(timeout, self.await_finalized())
            .await
            .map_err(|_| PoolError::ShutdownTimeout {
                index: self.index,
                timeout,
            })??;

        self.stdin.take();
        let waited = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await;
        match waited {
            Ok(Ok(status)) => debug!(worker = self.index, pid = self.pid, "Worker exited: {}", status),
            Ok(Err(e)) => warn!(worker = self.index, "Cannot wait for worker: {}", e),
            Err(_) => {
                warn!(worker = self.index, pid = self.pid, "Worker did not exit after finalizing");
                self.kill().await;
            }
        }
        Ok(finalized)
    }

    async fn await_finalized(&mut self) -> Result<Option<HookFailure>, PoolError> {
        loop {
            match self.next_message().await {
                Ok(Some(WorkerMessage::Finalized { finalizer })) => return Ok(finalizer),
                Ok(Some(other)) => debug!(worker = self.index, "Ignoring {:?} while finalizing", other),
                Ok(None) => {
                    return Err(PoolError::Handshake {
                        index: self.index,
                        reason: "worker exited before finalizing".to_string(),
                    })
                }
                Err(ProtocolError::Decode { line, .. }) => {
                    warn!(worker = self.index, "Stray output on protocol channel: {}", line)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Wait briefly for a worker whose channel broke; returns how it ended
    pub async fn reap(&mut self) -> String {
        self.stdin.take();
        let waited = tokio::time::timeout(REAP_TIMEOUT, self.child.wait()).await;
        match waited {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => format!("unknown ({e})"),
            Err(_) => {
                self.kill().await;
                "unresponsive, killed".to_string()
            }
        }
    }

    /// How the worker ended, if it already has
    pub fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    /// Kill the worker and everything it started.
    ///
    /// The worker gets a SIGTERM first so it can take down the case it is
    /// running, which lives in a process group of its own. Then the worker's
    /// group gets a SIGKILL.
    pub async fn kill(&mut self) {
        #[cfg(unix)]
        {
            if let Err(e) = signal_group(self.pid, Signal::SIGTERM) {
                debug!(worker = self.index, pid = self.pid, "Cannot terminate worker group: {}", e);
            }
            if tokio::time::timeout(TERM_GRACE, self.child.wait()).await.is_err() {
                debug!(worker = self.index, pid = self.pid, "Worker ignored SIGTERM");
            }
            // workers lead their own group, so the group id is the worker pid
            if let Err(e) = kill_group(self.pid) {
                warn!(worker = self.index, pid = self.pid, "Cannot kill worker group: {}", e);
            }
        }
        if let Err(e) = self.child.start_kill() {
            debug!(worker = self.index, "Kill: {}", e);
        }
        let _ = self.child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WorkerSettings {
        WorkerSettings::default()
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let command = WorkerCommand::new("/nonexistent/verdant-worker");
        let err = WorkerProcess::spawn(0, &command, settings(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_silent_process_times_out() {
        let command = WorkerCommand::with_args("sh", ["-c", "sleep 5"]);
        let err = WorkerProcess::spawn(0, &command, settings(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::StartupTimeout { index: 0, .. }));
    }

    #[tokio::test]
    async fn test_early_exit_fails_handshake() {
        let command = WorkerCommand::with_args("sh", ["-c", "exit 0"]);
        let err = WorkerProcess::spawn(3, &command, settings(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            PoolError::Handshake { index, .. } => assert_eq!(index, 3),
            // the pipe may break before the configure line is written
            PoolError::Protocol(_) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_scripted_worker_handshake() {
        // answers ready, then finalized on the next line it reads
        let script = r#"read cfg; echo '{"type":"ready","pid":1}'; read req; echo '{"type":"finalized"}'"#;
        let command = WorkerCommand::with_args("sh", ["-c", script]);
        let (mut worker, initializer) =
            WorkerProcess::spawn(0, &command, settings(), Duration::from_secs(5))
                .await
                .unwrap();
        assert!(initializer.is_none());
        assert!(worker.pid() > 0);
        let finalizer = worker.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(finalizer.is_none());
    }

    #[tokio::test]
    async fn test_exited_sees_idle_death() {
        let script = r#"read cfg; echo '{"type":"ready","pid":1}'; exit 3"#;
        let command = WorkerCommand::with_args("sh", ["-c", script]);
        let (mut worker, _) = WorkerProcess::spawn(0, &command, settings(), Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let status = worker.exited().unwrap();
        assert!(status.contains('3'), "{status}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_takes_down_worker_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        // ignores SIGTERM and keeps a grandchild in its group
        let script = format!(
            r#"trap '' TERM; read cfg; sleep 30 & echo $! > '{}'; echo '{{"type":"ready","pid":1}}'; wait"#,
            pid_file.display()
        );
        let command = WorkerCommand::with_args("sh", ["-c", script.as_str()]);
        let (mut worker, _) = WorkerProcess::spawn(0, &command, settings(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(worker.exited().is_none());
        let grandchild: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), worker.kill())
            .await
            .unwrap();
        assert!(worker.exited().is_some());
        assert!(crate::utils::process::wait_gone(grandchild, Duration::from_secs(2)).await);
    }
}
