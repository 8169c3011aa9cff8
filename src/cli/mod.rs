//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::RunnerConfig;
use crate::executor::PoolSize;
use crate::output::OutputFormat;
use crate::utils::LogLevel;

/// Parallel, process-isolated test runner
#[derive(Parser, Debug)]
#[command(name = "verdant")]
#[command(version)]
#[command(about = "Run test suites across a pool of isolated worker processes")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// More log output (repeat for more)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    /// Level chosen on the command line, if any flag was given
    pub fn log_level(&self) -> Option<LogLevel> {
        (self.verbose > 0 || self.quiet).then(|| LogLevel::from_verbosity(self.verbose, self.quiet))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover and run test items
    Run(RunArgs),

    /// Discover test items and print the tree
    List(ListArgs),

    /// Print the JSON schema of suite files
    Schema,

    /// Worker process entry point
    #[command(hide = true)]
    Worker,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Files, directories or dotted names to run (default: .)
    pub targets: Vec<String>,

    /// Number of worker processes, or "auto"
    #[arg(short = 'j', long = "processes")]
    pub processes: Option<PoolSize>,

    /// Only run items whose id matches (glob, or substring without wildcards)
    #[arg(short = 'k', long)]
    pub filter: Option<String>,

    /// Let item output reach the terminal instead of capturing it
    #[arg(short, long = "allow-output")]
    pub allow_output: bool,

    /// Hook run once in every worker before its first task
    #[arg(long)]
    pub initializer: Option<String>,

    /// Hook run once in every worker after its last task
    #[arg(long)]
    pub finalizer: Option<String>,

    /// Collect per-task coverage data
    #[arg(long)]
    pub coverage: bool,

    /// Where coverage data is written
    #[arg(long)]
    pub coverage_dir: Option<PathBuf>,

    /// Seconds running tasks get after the first interrupt
    #[arg(long)]
    pub grace: Option<u64>,

    /// File-name glob for suite files
    #[arg(long)]
    pub pattern: Option<String>,

    /// Extra root for dotted targets (repeatable)
    #[arg(short = 'p', long = "search-path")]
    pub search_paths: Vec<PathBuf>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,

    /// Also write the report to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl RunArgs {
    /// Flags given on the command line replace configured values
    pub fn apply_to(&self, config: &mut RunnerConfig) {
        if let Some(processes) = self.processes {
            config.processes = processes;
        }
        if let Some(filter) = &self.filter {
            config.filter = Some(filter.clone());
        }
        if self.allow_output {
            config.allow_output = true;
        }
        if let Some(initializer) = &self.initializer {
            config.initializer = Some(initializer.clone());
        }
        if let Some(finalizer) = &self.finalizer {
            config.finalizer = Some(finalizer.clone());
        }
        if self.coverage {
            config.coverage = true;
        }
        if let Some(dir) = &self.coverage_dir {
            config.coverage_dir = Some(dir.clone());
        }
        if let Some(grace) = self.grace {
            config.grace_secs = grace;
        }
        if let Some(pattern) = &self.pattern {
            config.pattern = pattern.clone();
        }
        config.search_paths.extend(self.search_paths.iter().cloned());
    }

    pub fn targets_or_default(&self) -> Vec<String> {
        if self.targets.is_empty() {
            vec![".".to_string()]
        } else {
            self.targets.clone()
        }
    }
}

/// Arguments for list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Files, directories or dotted names to discover (default: .)
    pub targets: Vec<String>,

    /// File-name glob for suite files
    #[arg(long)]
    pub pattern: Option<String>,

    /// Extra root for dotted targets (repeatable)
    #[arg(short = 'p', long = "search-path")]
    pub search_paths: Vec<PathBuf>,

    /// Print item ids only, one per line
    #[arg(long)]
    pub ids: bool,

    /// Configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}
