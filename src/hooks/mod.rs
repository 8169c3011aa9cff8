//! Worker initializer/finalizer hooks
//!
//! A hook is given as a reference string and resolved once, when the pool
//! starts, by a chain of [`HookResolver`]s. The resolved [`HookSpec`] is sent
//! to every worker, which invokes it at the matching point of its lifecycle.
//!
//! Recognized references:
//! - `builtin:<name>` or a bare `<name>`: a hook from the built-in registry
//! - `cmd:<shell command>`: a command run with `sh -c` inside the worker

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::{HookFailure, HookFailureKind, HookPhase};

const BUILTIN_SCHEME: &str = "builtin:";
const COMMAND_SCHEME: &str = "cmd:";

/// Phases every hook may run in
const ANY_PHASE: &[HookPhase] = &[HookPhase::Initializer, HookPhase::Finalizer];

/// Resolved, invocable hook
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookSpec {
    Builtin { reference: String, name: String },
    Command { reference: String, command: String },
}

impl HookSpec {
    pub fn reference(&self) -> &str {
        match self {
            HookSpec::Builtin { reference, .. } | HookSpec::Command { reference, .. } => reference,
        }
    }

    /// Run the hook inside a worker
    pub async fn invoke(&self, ctx: &HookContext<'_>) -> Result<(), HookFailure> {
        let failure = |kind, message: String| {
            HookFailure::new(ctx.phase, self.reference(), kind, message).in_worker(ctx.worker_pid)
        };

        match self {
            HookSpec::Builtin { name, .. } => {
                let hook = builtin(name).ok_or_else(|| {
                    failure(
                        HookFailureKind::NotInvocable,
                        format!("built-in hook '{name}' is not available"),
                    )
                })?;
                if !hook.phases.contains(&ctx.phase) {
                    return Err(failure(
                        HookFailureKind::NotInvocable,
                        format!("'{name}' cannot run as {}", ctx.phase),
                    ));
                }
                debug!("Running built-in {} hook {}", ctx.phase, name);
                (hook.run)(ctx).map_err(|message| failure(HookFailureKind::Raised, message))
            }
            HookSpec::Command { command, .. } => {
                debug!("Running {} command: {}", ctx.phase, command);
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(command)
                    .env("VERDANT_WORKER_PID", ctx.worker_pid.to_string())
                    .env("VERDANT_WORKER_INDEX", ctx.worker_index.to_string())
                    .env("VERDANT_HOOK_PHASE", ctx.phase.to_string())
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| {
                        failure(HookFailureKind::NotInvocable, format!("cannot spawn: {e}"))
                    })?;

                if output.status.success() {
                    Ok(())
                } else {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let tail = stderr.trim().lines().last().unwrap_or_default();
                    Err(failure(
                        HookFailureKind::Raised,
                        format!("{} {}", output.status, tail).trim().to_string(),
                    ))
                }
            }
        }
    }
}

/// What a hook can see of its worker
#[derive(Clone, Copy, Debug)]
pub struct HookContext<'a> {
    pub phase: HookPhase,
    pub worker_pid: u32,
    pub worker_index: usize,
    pub coverage_dir: Option<&'a Path>,
}

/// One strategy for turning a reference into a hook
pub trait HookResolver: Send + Sync {
    /// `None` when the reference is outside this resolver's namespace
    fn resolve(&self, reference: &str, phase: HookPhase) -> Option<Result<HookSpec, HookFailure>>;
}

/// Lookup in the built-in registry
pub struct BuiltinResolver;

impl HookResolver for BuiltinResolver {
    fn resolve(&self, reference: &str, phase: HookPhase) -> Option<Result<HookSpec, HookFailure>> {
        let (name, explicit) = match reference.strip_prefix(BUILTIN_SCHEME) {
            Some(name) => (name, true),
            None if !reference.contains(':') => (reference, false),
            None => return None,
        };

        let Some(hook) = builtin(name) else {
            return explicit.then(|| {
                Err(HookFailure::new(
                    phase,
                    reference,
                    HookFailureKind::Unresolved,
                    format!(
                        "no built-in hook named '{name}' (known: {})",
                        builtin_names().join(", ")
                    ),
                ))
            });
        };

        if !hook.phases.contains(&phase) {
            return Some(Err(HookFailure::new(
                phase,
                reference,
                HookFailureKind::NotInvocable,
                format!("'{name}' cannot run as {phase}"),
            )));
        }

        Some(Ok(HookSpec::Builtin {
            reference: reference.to_string(),
            name: name.to_string(),
        }))
    }
}

/// `cmd:` references
pub struct CommandResolver;

impl HookResolver for CommandResolver {
    fn resolve(&self, reference: &str, phase: HookPhase) -> Option<Result<HookSpec, HookFailure>> {
        let command = reference.strip_prefix(COMMAND_SCHEME)?.trim();
        if command.is_empty() {
            return Some(Err(HookFailure::new(
                phase,
                reference,
                HookFailureKind::NotInvocable,
                "empty command",
            )));
        }
        Some(Ok(HookSpec::Command {
            reference: reference.to_string(),
            command: command.to_string(),
        }))
    }
}

/// Resolvers tried in order; the first that recognizes a reference decides
pub struct ResolverChain {
    resolvers: Vec<Box<dyn HookResolver>>,
}

impl ResolverChain {
    pub fn empty() -> Self {
        Self {
            resolvers: Vec::new(),
        }
    }

    /// Built-in registry, then shell commands
    pub fn standard() -> Self {
        Self::empty()
            .with(BuiltinResolver)
            .with(CommandResolver)
    }

    pub fn with(mut self, resolver: impl HookResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn resolve(&self, reference: &str, phase: HookPhase) -> Result<HookSpec, HookFailure> {
        let reference = reference.trim();
        self.resolvers
            .iter()
            .find_map(|r| r.resolve(reference, phase))
            .unwrap_or_else(|| {
                Err(HookFailure::new(
                    phase,
                    reference,
                    HookFailureKind::Unresolved,
                    "no resolver recognizes this reference",
                ))
            })
    }
}

impl Default for ResolverChain {
    fn default() -> Self {
        Self::standard()
    }
}

struct BuiltinHook {
    name: &'static str,
    phases: &'static [HookPhase],
    run: fn(&HookContext<'_>) -> Result<(), String>,
}

const BUILTINS: &[BuiltinHook] = &[
    BuiltinHook {
        name: "noop",
        phases: ANY_PHASE,
        run: noop,
    },
    BuiltinHook {
        name: "log-environment",
        phases: ANY_PHASE,
        run: log_environment,
    },
    BuiltinHook {
        name: "prepare-coverage-dir",
        phases: &[HookPhase::Initializer],
        run: prepare_coverage_dir,
    },
    BuiltinHook {
        name: "report-coverage",
        phases: &[HookPhase::Finalizer],
        run: report_coverage,
    },
];

fn builtin(name: &str) -> Option<&'static BuiltinHook> {
    BUILTINS.iter().find(|hook| hook.name == name)
}

/// Names of the built-in hooks
pub fn builtin_names() -> Vec<&'static str> {
    BUILTINS.iter().map(|hook| hook.name).collect()
}

fn noop(_ctx: &HookContext<'_>) -> Result<(), String> {
    Ok(())
}

fn log_environment(ctx: &HookContext<'_>) -> Result<(), String> {
    let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
    info!(
        pid = ctx.worker_pid,
        index = ctx.worker_index,
        phase = %ctx.phase,
        cwd = %cwd.display(),
        tmpdir = %std::env::temp_dir().display(),
        "Worker environment"
    );
    Ok(())
}

fn prepare_coverage_dir(ctx: &HookContext<'_>) -> Result<(), String> {
    match ctx.coverage_dir {
        Some(dir) => std::fs::create_dir_all(dir)
            .map_err(|e| format!("cannot create {}: {e}", dir.display())),
        None => Ok(()),
    }
}

fn report_coverage(ctx: &HookContext<'_>) -> Result<(), String> {
    let Some(dir) = ctx.coverage_dir else {
        return Ok(());
    };
    let prefix = format!("verdant-{}-", ctx.worker_pid);
    let count = std::fs::read_dir(dir)
        .map_err(|e| format!("cannot read {}: {e}", dir.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
        .count();
    info!(pid = ctx.worker_pid, files = count, "Coverage data written");
    Ok(())
}
