//! In-process coordinator runs against real worker processes

mod common;

use common::{ids, options, write_suite};
use std::time::{Duration, Instant};
use verdant::executor::{Coordinator, InterruptHandle, Interrupts};
use verdant::models::{HookFailureKind, ItemRef, RunResult, Verdict};
use verdant::output::Reporter;

/// Sends `count` interrupts as soon as the first item starts
struct InterruptOnStart {
    handle: InterruptHandle,
    count: usize,
}

impl Reporter for InterruptOnStart {
    fn on_started(&mut self, _item: &ItemRef, _partial: &RunResult) {
        for _ in 0..std::mem::take(&mut self.count) {
            self.handle.interrupt();
        }
    }
}

#[tokio::test]
async fn test_crashing_item_gets_one_error() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "test_crash.yaml",
        r#"
cases:
  - name: before
    run: "true"
  - name: boom
    run: "kill -9 $VERDANT_WORKER_PID"
  - name: after
    run: "true"
  - name: last
    run: "true"
"#,
    );

    let (_handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 2));
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert_eq!(ids(&result.errors), ["test_crash.boom"]);
    assert_eq!(
        ids(&result.passing),
        ["test_crash.after", "test_crash.before", "test_crash.last"]
    );
    assert_eq!(result.worker_crashes.len(), 1);
    assert_eq!(result.tests_run, 4);
}

#[tokio::test]
async fn test_group_setup_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker.log");
    write_suite(
        dir.path(),
        "test_fixtures.yaml",
        &format!(
            r#"
groups:
  - name: Db
    setup: "echo setup >> '{m}'"
    teardown: "echo teardown >> '{m}'"
    cases:
      - name: one
        run: "echo case >> '{m}'"
      - name: two
        run: "echo case >> '{m}'"
      - name: three
        run: "echo case >> '{m}'"
"#,
            m = marker.display()
        ),
    );

    let (_handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 3));
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(result.was_successful());
    assert_eq!(result.count(Verdict::Passed), 3);
    let log = std::fs::read_to_string(&marker).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines, ["setup", "case", "case", "case", "teardown"]);
}

#[tokio::test]
async fn test_setup_failure_skips_group() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "test_fx.yaml",
        r#"
cases:
  - name: free
    run: "true"
groups:
  - name: G
    setup: "echo no database >&2; exit 3"
    cases:
      - name: a
        run: "true"
      - name: b
        run: "true"
"#,
    );

    let (_handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 2));
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert_eq!(ids(&result.errors), ["test_fx.G [setup]"]);
    assert_eq!(ids(&result.skipped), ["test_fx.G.a", "test_fx.G.b"]);
    assert!(result.skipped[0]
        .detail
        .as_deref()
        .unwrap()
        .contains("setup of test_fx.G failed"));
    assert_eq!(ids(&result.passing), ["test_fx.free"]);
    assert_eq!(result.tests_run, 3);
    assert!(!result.was_successful());
}

#[tokio::test]
async fn test_hook_failures_do_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "test_h.yaml",
        "cases:\n  - name: a\n    run: \"true\"\n",
    );

    let mut opts = options(dir.path(), 1);
    opts.initializer = Some("builtin:missing".into());
    opts.finalizer = Some("cmd:exit 3".into());
    let (_handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(opts);
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(result.was_successful());
    let kinds: Vec<HookFailureKind> = result.hook_failures.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, [HookFailureKind::Unresolved, HookFailureKind::Raised]);
    assert!(result.hook_failures[1].worker_pid.is_some());
}

#[tokio::test]
async fn test_first_interrupt_drains() {
    let dir = tempfile::tempdir().unwrap();
    let cases: String = (0..4)
        .map(|i| format!("  - name: slow_{i}\n    run: \"sleep 1\"\n"))
        .collect();
    write_suite(dir.path(), "test_slow.yaml", &format!("cases:\n{cases}"));

    let (handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 1)).with_reporter(InterruptOnStart {
        handle: handle.clone(),
        count: 1,
    });
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(result.interrupted);
    assert_eq!(ids(&result.passing), ["test_slow.slow_0"]);
    assert!(result.unfinished.is_empty());
    assert_eq!(result.not_run, 3);
    assert!(!result.was_successful());
}

#[tokio::test]
async fn test_second_interrupt_finalizes_immediately() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "test_stuck.yaml",
        "cases:\n  - name: stuck\n    run: \"sleep 30\"\n  - name: queued\n    run: \"true\"\n",
    );

    let (handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 1)).with_reporter(InterruptOnStart {
        handle: handle.clone(),
        count: 2,
    });
    let started = Instant::now();
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(result.interrupted);
    assert_eq!(result.unfinished, ["test_stuck.stuck"]);
    assert_eq!(result.not_run, 1);
    assert_eq!(result.tests_run, 0);
}

#[tokio::test]
async fn test_grace_period_expiry_finalizes() {
    let dir = tempfile::tempdir().unwrap();
    write_suite(
        dir.path(),
        "test_stuck.yaml",
        "cases:\n  - name: stuck\n    run: \"sleep 30\"\n",
    );

    let (handle, interrupts) = Interrupts::new();
    let opts = options(dir.path(), 1).with_grace_period(Duration::from_secs(1));
    let mut coordinator = Coordinator::new(opts).with_reporter(InterruptOnStart {
        handle: handle.clone(),
        count: 1,
    });
    let started = Instant::now();
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(result.unfinished, ["test_stuck.stuck"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_timed_out_case_keeps_output_and_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    write_suite(
        dir.path(),
        "test_slow.yaml",
        &format!(
            r#"
cases:
  - name: hangs
    run: "echo partial; sleep 30 & echo $! > '{p}'; wait"
    timeout_secs: 1
  - name: quick
    run: "true"
"#,
            p = pid_file.display()
        ),
    );

    let (_handle, interrupts) = Interrupts::new();
    let mut coordinator = Coordinator::new(options(dir.path(), 2));
    let started = Instant::now();
    let result = coordinator.run(&[".".into()], interrupts).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(ids(&result.errors), ["test_slow.hangs"]);
    assert_eq!(ids(&result.passing), ["test_slow.quick"]);
    let hangs = result.outcome("test_slow.hangs").unwrap();
    assert_eq!(hangs.stdout, "partial\n");
    assert!(hangs.detail.as_deref().unwrap().contains("timed out"));
    assert!(result.worker_crashes.is_empty());

    let grandchild: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(common::wait_gone(grandchild, Duration::from_secs(2)));
}
