//! Task execution inside a worker
//!
//! A task names a node of a suite. The worker reloads the suite, enters the
//! groups above the node (running their setups), runs the node, then leaves
//! the groups again in reverse order. Every selected item gets exactly one
//! outcome, whatever goes wrong along the way.

use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use super::command::{CommandOutput, ShellCommand, Termination};
use super::scope::TaskScope;
use super::EventSink;
use crate::discovery::load_suite;
use crate::models::{
    CaseSpec, FixturePhase, ItemId, ItemKind, ItemOutcome, ItemRef, NodeRef, Verdict, WorkGroup,
    WorkItem, WorkNode,
};
use crate::protocol::{ProtocolError, WorkerSettings, WorkerTask};

/// Exit status a case uses to skip itself
pub const SKIP_EXIT_CODE: i32 = 77;

/// Run one task, reporting through `sink`
pub async fn execute_task<W>(
    task: &WorkerTask,
    settings: &WorkerSettings,
    sink: &mut EventSink<W>,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let workdir = task
        .target
        .suite
        .parent()
        .unwrap_or_else(|| Path::new("."));

    let scope = match TaskScope::enter(task.job_id, workdir, settings.coverage_dir.as_deref()) {
        Ok(scope) => scope,
        Err(e) => {
            return sink
                .fail_unreported(&format!("cannot prepare task environment: {e}"))
                .await;
        }
    };

    match load_suite(&task.target.suite, &task.target.module) {
        Ok(module) => {
            let runner = Runner {
                settings,
                scope_env: scope.env(),
                selected: task.items.iter().map(|item| item.id.clone()).collect(),
            };
            runner.run_target(&module, &task.target.path, sink).await?;
        }
        Err(e) => {
            sink.fail_unreported(&format!("loader failure: {e}")).await?;
        }
    }

    sink.fail_unreported(&format!("item not found in {}", task.target.suite.display()))
        .await?;
    drop(scope);
    Ok(())
}

struct Runner<'a> {
    settings: &'a WorkerSettings,
    scope_env: Vec<(String, OsString)>,
    selected: HashSet<ItemId>,
}

impl Runner<'_> {
    async fn run_target<W>(
        &self,
        module: &WorkGroup,
        path: &[String],
        sink: &mut EventSink<W>,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        if path.is_empty() {
            return self.run_group(module, sink).await;
        }
        let Some(node) = module.find(path) else {
            warn!("Task target {} not found in {}", path.join("."), module.id);
            return Ok(());
        };

        let mut entered: Vec<&WorkGroup> = Vec::new();
        let mut blocked = false;
        for group in module.ancestors(path) {
            if let Err(failure) = self.setup(group, sink).await? {
                self.skip_selected(group, &failure, sink).await?;
                blocked = true;
                break;
            }
            entered.push(group);
        }

        if !blocked {
            match node {
                NodeRef::Item(item) => self.run_item(item, sink).await?,
                NodeRef::Group(group) => self.run_group(group, sink).await?,
            }
        }

        for group in entered.into_iter().rev() {
            self.teardown(group, sink).await?;
        }
        Ok(())
    }

    fn run_group<'a, W>(
        &'a self,
        group: &'a WorkGroup,
        sink: &'a mut EventSink<W>,
    ) -> LocalBoxFuture<'a, Result<(), ProtocolError>>
    where
        W: AsyncWrite + Unpin + 'a,
    {
        async move {
            if !group.contains_any(&self.selected) {
                return Ok(());
            }
            if let Err(failure) = self.setup(group, sink).await? {
                return self.skip_selected(group, &failure, sink).await;
            }

            for member in &group.members {
                match member {
                    WorkNode::Item(item) if self.selected.contains(&item.id) => {
                        self.run_item(item, sink).await?
                    }
                    WorkNode::Item(_) => {}
                    WorkNode::Group(inner) => self.run_group(inner, sink).await?,
                }
            }

            self.teardown(group, sink).await
        }
        .boxed_local()
    }

    async fn run_item<W>(&self, item: &WorkItem, sink: &mut EventSink<W>) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let item_ref = item.item_ref();
        sink.started(&item_ref).await?;

        let outcome = match &item.kind {
            ItemKind::LoadFailure { message } => {
                ItemOutcome::error(item_ref, format!("loader failure: {message}"))
            }
            ItemKind::Case(spec) => match &spec.skip {
                Some(reason) => ItemOutcome::skipped(item_ref, reason.clone()),
                None => self.run_case(item_ref, spec).await,
            },
        };
        sink.completed(outcome).await
    }

    async fn run_case(&self, item: ItemRef, spec: &CaseSpec) -> ItemOutcome {
        let command = self
            .command(spec)
            .env("VERDANT_ITEM_ID", item.id.as_str())
            .passthrough(self.settings.allow_output_passthrough);
        match command.run().await {
            Ok(output) => classify(item, spec, output),
            Err(e) => ItemOutcome::error(item, format!("cannot start command: {e}")),
        }
    }

    fn command(&self, spec: &CaseSpec) -> ShellCommand {
        let timeout = spec
            .timeout_secs
            .or(self.settings.default_timeout_secs)
            .map(Duration::from_secs);
        ShellCommand::new(spec.run.as_str())
            .envs(self.scope_env.iter().cloned())
            .envs(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .timeout(timeout)
    }

    /// `Ok(Err(detail))` when the setup ran and failed; the failure is already reported
    async fn setup<W>(
        &self,
        group: &WorkGroup,
        sink: &mut EventSink<W>,
    ) -> Result<Result<(), String>, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        match &group.setup {
            Some(spec) => self.fixture(group, FixturePhase::Setup, spec, sink).await,
            None => Ok(Ok(())),
        }
    }

    async fn teardown<W>(&self, group: &WorkGroup, sink: &mut EventSink<W>) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(spec) = &group.teardown {
            let _ = self
                .fixture(group, FixturePhase::Teardown, spec, sink)
                .await?;
        }
        Ok(())
    }

    async fn fixture<W>(
        &self,
        group: &WorkGroup,
        phase: FixturePhase,
        spec: &CaseSpec,
        sink: &mut EventSink<W>,
    ) -> Result<Result<(), String>, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("Running {} of {}", phase, group.id);
        let (detail, outcome) = match self.command(spec).run().await {
            Ok(output) if output.termination.success() => return Ok(Ok(())),
            Ok(output) => {
                let detail = summarize(&format!("{phase} failed"), &output);
                let outcome = ItemOutcome::error(ItemRef::fixture(&group.id, phase), detail.clone())
                    .with_duration(output.duration_ms())
                    .with_output(output.stdout, output.stderr);
                (detail, outcome)
            }
            Err(e) => {
                let detail = format!("{phase} could not start: {e}");
                let outcome = ItemOutcome::error(ItemRef::fixture(&group.id, phase), detail.clone());
                (detail, outcome)
            }
        };
        warn!("{} of {}: {}", phase, group.id, detail);
        sink.started(&outcome.item).await?;
        sink.completed(outcome).await?;
        Ok(Err(detail))
    }

    async fn skip_selected<W>(
        &self,
        group: &WorkGroup,
        reason: &str,
        sink: &mut EventSink<W>,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        for item in group.items() {
            if self.selected.contains(&item.id) {
                let item_ref = item.item_ref();
                sink.started(&item_ref).await?;
                sink.completed(ItemOutcome::skipped(
                    item_ref,
                    format!("setup of {} failed: {reason}", group.id),
                ))
                .await?;
            }
        }
        Ok(())
    }
}

/// Verdict for a finished case command
pub fn classify(item: ItemRef, spec: &CaseSpec, output: CommandOutput) -> ItemOutcome {
    let duration_ms = output.duration_ms();
    let (verdict, detail) = match &output.termination {
        Termination::Exited(0) if spec.expect_failure => (
            Verdict::UnexpectedSuccess,
            Some("passed but was expected to fail".to_string()),
        ),
        Termination::Exited(0) => (Verdict::Passed, None),
        Termination::Exited(SKIP_EXIT_CODE) => (
            Verdict::Skipped,
            Some(
                output
                    .stdout_tail()
                    .unwrap_or("skipped by the case")
                    .to_string(),
            ),
        ),
        Termination::Exited(126 | 127) => (
            Verdict::Error,
            Some(summarize("command could not be executed", &output)),
        ),
        Termination::Exited(_) if spec.expect_failure => (
            Verdict::ExpectedFailure,
            Some(summarize("failed as expected", &output)),
        ),
        Termination::Exited(_) => (Verdict::Failed, Some(summarize("failed", &output))),
        Termination::Signaled(_) | Termination::TimedOut(_) => {
            (Verdict::Error, Some(summarize("aborted", &output)))
        }
    };

    let mut outcome = ItemOutcome::new(item, verdict)
        .with_duration(duration_ms)
        .with_output(output.stdout, output.stderr);
    outcome.detail = detail;
    outcome
}

fn summarize(what: &str, output: &CommandOutput) -> String {
    match output.stderr_tail() {
        Some(tail) => format!("{what} ({}): {tail}", output.termination),
        None => format!("{what} ({})", output.termination),
    }
}
