//! verdant - parallel, process-isolated test runner
//!
//! ## Usage
//!
//! ```bash
//! # Run every suite under the current directory
//! verdant run
//!
//! # Four workers, only items matching "Math"
//! verdant run -j 4 -k Math suites/
//!
//! # Show what would run
//! verdant list suites/
//!
//! # JSON schema for suite files
//! verdant schema
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use tracing::info;

use verdant::cli::{Args, Command, ListArgs, RunArgs};
use verdant::config::{EnvConfig, RunnerConfig};
use verdant::discovery::{suite_schema, Discoverer};
use verdant::executor::{Coordinator, Interrupts};
use verdant::models::RunResult;
use verdant::output::{write_result_to_file, ProgressReporter, ResultFormatter};
use verdant::pool::WorkerCommand;
use verdant::utils::{init_logger, init_worker_logger, LogLevel};
use verdant::worker::run_worker;

/// Unsuccessful run
const EXIT_FAILED: u8 = 1;
/// Nothing could be discovered, or the runner itself failed
const EXIT_FATAL: u8 = 2;

fn main() -> ExitCode {
    let args = Args::parse();
    let env = EnvConfig::load();
    let level = args.log_level().or(env.log).unwrap_or(LogLevel::Warn);

    let outcome = match args.command {
        Command::Worker => {
            init_worker_logger(level);
            worker_main().map(|()| ExitCode::SUCCESS)
        }
        Command::Schema => print_schema().map(|()| ExitCode::SUCCESS),
        Command::List(list) => {
            init_logger(level);
            list_items(list, &env)
        }
        Command::Run(run) => {
            init_logger(level);
            run_main(run, &env, level, args.verbose > 0)
        }
    };

    outcome.unwrap_or_else(|e| {
        eprintln!("Error: {e:#}");
        ExitCode::from(EXIT_FATAL)
    })
}

fn worker_main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;
    runtime.block_on(run_worker())
}

fn print_schema() -> Result<()> {
    let schema = serde_json::to_string_pretty(&suite_schema()).context("Failed to render schema")?;
    println!("{schema}");
    Ok(())
}

fn list_items(args: ListArgs, env: &EnvConfig) -> Result<ExitCode> {
    let mut config = RunnerConfig::resolve(args.config.as_deref(), env)?;
    if let Some(pattern) = &args.pattern {
        config.pattern = pattern.clone();
    }
    config.search_paths.extend(args.search_paths.iter().cloned());
    let options = config.to_run_options();

    let targets = if args.targets.is_empty() {
        vec![".".to_string()]
    } else {
        args.targets.clone()
    };
    let discoverer = Discoverer::new(&options.base_dir, &options.discovery_pattern)
        .context("Failed to set up discovery")?
        .with_search_paths(options.search_paths);
    let (tree, failures) = discoverer.discover_all(&targets);

    if args.ids {
        for item in tree.items() {
            println!("{}", item.id);
        }
    } else {
        let formatter = ResultFormatter::default();
        print!("{}", formatter.format_tree(&tree));
    }

    if failures.len() >= targets.len() {
        return Ok(ExitCode::from(EXIT_FATAL));
    }
    Ok(ExitCode::SUCCESS)
}

fn run_main(args: RunArgs, env: &EnvConfig, level: LogLevel, verbose: bool) -> Result<ExitCode> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    runtime.block_on(run_items(args, env, level, verbose))
}

async fn run_items(
    args: RunArgs,
    env: &EnvConfig,
    level: LogLevel,
    verbose: bool,
) -> Result<ExitCode> {
    let mut config = RunnerConfig::resolve(args.config.as_deref(), env)?;
    args.apply_to(&mut config);
    let mut options = config.to_run_options();

    let worker = match options.worker_program.take() {
        Some(command) => command,
        None => WorkerCommand::current_exe().context("Cannot locate the verdant executable")?,
    };
    options.worker_program = Some(worker.with_env(
        "VERDANT_LOG",
        level.to_tracing_level().to_string().to_lowercase(),
    ));

    let targets = args.targets_or_default();
    info!("Targets: {}", targets.join(" "));

    let (handle, interrupts) = Interrupts::new();
    let listener = handle.listen_for_ctrl_c();
    drop(handle);

    let mut coordinator =
        Coordinator::new(options).with_reporter(ProgressReporter::stderr(verbose));
    let result = coordinator.run(&targets, interrupts).await;
    listener.abort();
    let result = result?;

    let mut formatter = ResultFormatter::new(args.format);
    if !std::io::stdout().is_terminal() {
        formatter = formatter.no_color();
    }
    println!("{}", formatter.format_result(&result));

    if let Some(path) = &args.output {
        write_result_to_file(path, &result, args.format)?;
        info!("Report written to {}", path.display());
    }

    Ok(exit_code(&result, targets.len()))
}

fn exit_code(result: &RunResult, targets: usize) -> ExitCode {
    if result.tests_run == 0 && result.discovery_failures.len() >= targets {
        ExitCode::from(EXIT_FATAL)
    } else if result.was_successful() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    }
}
