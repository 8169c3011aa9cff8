//! Shell command execution for cases and fixtures

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::utils::Timer;

/// How long to keep reading a killed command's pipes
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How a command ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(Option<i32>),
    TimedOut(Duration),
}

impl Termination {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Termination::Exited(code),
            None => Termination::Signaled(signal_of(&status)),
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Termination::Exited(0))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exit status {code}"),
            Termination::Signaled(Some(signal)) => write!(f, "terminated by signal {signal}"),
            Termination::Signaled(None) => write!(f, "terminated by a signal"),
            Termination::TimedOut(limit) => write!(f, "timed out after {}s", limit.as_secs()),
        }
    }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Captured result of a command
#[derive(Clone, Debug)]
pub struct CommandOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// Last non-empty line of stderr, for one-line summaries
    pub fn stderr_tail(&self) -> Option<&str> {
        last_line(&self.stderr)
    }

    pub fn stdout_tail(&self) -> Option<&str> {
        last_line(&self.stdout)
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rfind(|line| !line.is_empty())
}

/// `sh -c` invocation with a watchdog
#[derive(Clone, Debug)]
pub struct ShellCommand {
    command: String,
    env: Vec<(String, OsString)>,
    timeout: Option<Duration>,
    passthrough: bool,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            env: Vec::new(),
            timeout: None,
            passthrough: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Let output through instead of capturing it. Stdout goes to our stderr
    /// because a worker's stdout carries the protocol.
    pub fn passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Run to completion or until the timeout. A timed-out command loses its
    /// whole process group and keeps the output it wrote before the kill.
    pub async fn run(&self) -> io::Result<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // its own group, so a timeout reaches everything the command forked
        #[cfg(unix)]
        cmd.process_group(0);

        if self.passthrough {
            cmd.stdout(Stdio::from(io::stderr())).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let timer = Timer::start(&self.command);
        let mut child = cmd.spawn()?;
        let mut group = GroupGuard::new(child.id());
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let finished = {
            let run = async {
                let (status, (), ()) = tokio::join!(
                    child.wait(),
                    drain(stdout_pipe.as_mut(), &mut stdout),
                    drain(stderr_pipe.as_mut(), &mut stderr),
                );
                status
            };
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, run).await.ok(),
                None => Some(run.await),
            }
        };

        let termination = match (finished, self.timeout) {
            (Some(status), _) => {
                let status = status?;
                group.release();
                Termination::from_status(status)
            }
            (None, limit) => {
                group.kill();
                if let Err(e) = child.start_kill() {
                    debug!("Timed-out command already gone: {}", e);
                }
                let _ = child.wait().await;
                // whatever the killed group wrote last
                let leftovers = async {
                    tokio::join!(
                        drain(stdout_pipe.as_mut(), &mut stdout),
                        drain(stderr_pipe.as_mut(), &mut stderr),
                    )
                };
                if tokio::time::timeout(DRAIN_TIMEOUT, leftovers).await.is_err() {
                    debug!("Output pipes still open after the kill; keeping what was read");
                }
                Termination::TimedOut(limit.unwrap_or_default())
            }
        };

        Ok(CommandOutput {
            termination,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: timer.stop(),
        })
    }
}

/// Append everything `pipe` yields to `buf`. Cancel-safe: bytes already
/// read stay in `buf`.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<&mut R>, buf: &mut Vec<u8>) {
    let Some(pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                debug!("Output pipe failed: {}", e);
                return;
            }
        }
    }
}

/// Kills a command's process group unless released first, so a cancelled
/// run leaves nothing behind
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// The command finished on its own; anything it left running may be
    /// wanted, like a server started by a group setup
    fn release(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        if let Err(e) = crate::utils::process::kill_group(pgid) {
            warn!(pgid, "Cannot kill command group: {}", e);
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}
