//! Process-group signals
//!
//! Workers and case commands each lead their own process group, so one
//! signal to the group reaches everything they started.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

/// Send `signal` to the group led by `pid`. A group that is already gone
/// counts as delivered.
pub fn signal_group(pid: u32, signal: Signal) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    // 0 and 1 would address our own group or init
    if pgid <= 1 {
        return Err(Errno::EINVAL);
    }
    match killpg(Pid::from_raw(pgid), signal) {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

pub fn kill_group(pid: u32) -> nix::Result<()> {
    signal_group(pid, Signal::SIGKILL)
}

/// Whether `pid` has died, zombies included
#[cfg(test)]
pub(crate) fn is_gone(pid: i32) -> bool {
    if nix::sys::signal::kill(Pid::from_raw(pid), None).is_err() {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .map(|stat| {
            stat.rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Poll until `pid` is gone, for at most `limit`
#[cfg(test)]
pub(crate) async fn wait_gone(pid: i32, limit: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if is_gone(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    is_gone(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    #[test]
    fn test_reserved_ids_are_refused() {
        assert_eq!(kill_group(0), Err(Errno::EINVAL));
        assert_eq!(kill_group(1), Err(Errno::EINVAL));
        assert_eq!(kill_group(u32::MAX), Err(Errno::EINVAL));
    }

    #[tokio::test]
    async fn test_kill_reaches_grandchildren() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .stdout(Stdio::piped())
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let mut stdout = tokio::io::BufReader::new(child.stdout.take().unwrap());
        let mut line = String::new();
        tokio::io::AsyncBufReadExt::read_line(&mut stdout, &mut line)
            .await
            .unwrap();
        let grandchild: i32 = line.trim().parse().unwrap();

        kill_group(pid).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(wait_gone(grandchild, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_finished_group_is_not_an_error() {
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert_eq!(kill_group(pid), Ok(()));
    }
}
