#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use verdant::executor::{PoolSize, RunOptions};
use verdant::models::RunResult;
use verdant::pool::WorkerCommand;

pub const BIN: &str = env!("CARGO_BIN_EXE_verdant");

pub fn write_suite(dir: &Path, name: &str, yaml: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, yaml).unwrap();
    path
}

/// The binary with no inherited `VERDANT_*` configuration
pub fn verdant(dir: &Path) -> Command {
    let mut cmd = Command::new(BIN);
    cmd.current_dir(dir);
    for (key, _) in std::env::vars() {
        if key.starts_with("VERDANT_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

/// `verdant run --format json` and the parsed result
pub fn run_json(dir: &Path, extra: &[&str]) -> (RunResult, Output) {
    let output = verdant(dir)
        .args(["run", "--format", "json"])
        .args(extra)
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    let result: RunResult = serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "unparseable output ({e}):\n{stdout}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stderr)
        )
    });
    (result, output)
}

/// Options for driving a run in-process against the real worker binary
pub fn options(dir: &Path, workers: usize) -> RunOptions {
    RunOptions::default()
        .with_base_dir(dir)
        .with_pool_size(PoolSize::Fixed(workers))
        .with_worker_program(WorkerCommand::new(BIN))
}

pub fn ids(outcomes: &[verdant::models::ItemOutcome]) -> Vec<&str> {
    let mut ids: Vec<&str> = outcomes.iter().map(|o| o.item.id.as_str()).collect();
    ids.sort();
    ids
}

/// Poll until `pid` has died (a zombie counts), for at most `limit`
#[cfg(unix)]
pub fn wait_gone(pid: i32, limit: Duration) -> bool {
    let gone = || {
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
            return true;
        }
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| {
                stat.rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z'))
            })
            .unwrap_or(false)
    };
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if gone() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    gone()
}
