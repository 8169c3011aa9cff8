//! Output formatters for run results
//!
//! Provides table, JSON, CSV and one-line summary formats, plus the tree
//! listing used by `verdant list`.

use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use crate::models::{ItemKind, ItemOutcome, RunResult, Verdict, WorkGroup, WorkNode, WorkTree};

/// Lines of captured stderr shown under a failure in the table
const STDERR_TAIL_LINES: usize = 10;

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            "csv" => Ok(OutputFormat::Csv),
            "summary" => Ok(OutputFormat::Summary),
            other => Err(format!(
                "unknown format '{other}' (expected table, json, json-pretty, csv or summary)"
            )),
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: &'a str,
    group: &'a str,
    name: &'a str,
    verdict: String,
    duration_ms: u64,
    worker_pid: Option<u32>,
    detail: &'a str,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Format a finished run
    pub fn format_result(&self, result: &RunResult) -> String {
        match self.format {
            OutputFormat::Table => self.format_table(result),
            OutputFormat::Json => serde_json::to_string(result).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Csv => self.format_csv(result),
            OutputFormat::Summary => self.format_summary(result),
        }
    }

    fn verdict_label(&self, verdict: Verdict) -> String {
        let label = match verdict {
            Verdict::Passed => "✓ PASS",
            Verdict::Failed => "✗ FAIL",
            Verdict::Error => "! ERROR",
            Verdict::Skipped => "○ SKIP",
            Verdict::ExpectedFailure => "✗ XFAIL",
            Verdict::UnexpectedSuccess => "✓ XPASS",
        };
        if !self.colorize {
            return label.to_string();
        }
        let color = match verdict {
            Verdict::Passed => "32",
            v if v.is_problem() => "31",
            _ => "33",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_outcome_line(&self, outcome: &ItemOutcome) -> String {
        let mut line = format!(
            "  {:8} {:32} [{:>6}ms]",
            self.verdict_label(outcome.verdict),
            outcome.item.name,
            outcome.duration_ms
        );
        if outcome.verdict == Verdict::Skipped {
            if let Some(reason) = &outcome.detail {
                let _ = write!(line, " {reason}");
            }
        }
        line
    }

    fn format_table(&self, result: &RunResult) -> String {
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        let _ = writeln!(
            output,
            "║  verdant run started {:40} ║",
            result.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        );
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        // Grouped by the group id each outcome carries
        let mut groups: BTreeMap<&str, Vec<&ItemOutcome>> = BTreeMap::new();
        for outcome in result.outcomes() {
            groups.entry(outcome.item.group.as_str()).or_default().push(outcome);
        }
        for (group, outcomes) in &mut groups {
            outcomes.sort_by(|a, b| a.item.id.cmp(&b.item.id));
            let _ = writeln!(output, "\n{group}");
            for outcome in outcomes.iter() {
                output.push_str(&self.format_outcome_line(outcome));
                output.push('\n');
            }
        }

        let problems: Vec<&ItemOutcome> = result
            .failures
            .iter()
            .chain(&result.errors)
            .chain(&result.unexpected_successes)
            .collect();
        if !problems.is_empty() {
            output.push_str("\n───────────────────────────────────────────────────────────────\n");
            for outcome in problems {
                let _ = writeln!(output, "{} {}", self.verdict_label(outcome.verdict), outcome.item);
                if let Some(detail) = &outcome.detail {
                    let _ = writeln!(output, "    {detail}");
                }
                let tail: Vec<&str> = outcome.stderr.lines().collect();
                let start = tail.len().saturating_sub(STDERR_TAIL_LINES);
                for line in &tail[start..] {
                    let _ = writeln!(output, "    | {line}");
                }
            }
        }

        let notes = self.format_notes(result);
        if !notes.is_empty() {
            output.push_str("\n───────────────────────────────────────────────────────────────\n");
            output.push_str(&notes);
        }

        output.push_str("\n═══════════════════════════════════════════════════════════════\n");
        let _ = writeln!(output, " {}", result);
        let _ = writeln!(output, " {}", self.status_word(result));
        output.push_str("═══════════════════════════════════════════════════════════════\n");

        output
    }

    fn format_notes(&self, result: &RunResult) -> String {
        let mut notes = String::new();
        if result.no_items_found {
            notes.push_str(" No items found\n");
        }
        for failure in &result.discovery_failures {
            let _ = writeln!(notes, " discovery: {failure}");
        }
        for failure in &result.hook_failures {
            let _ = writeln!(notes, " hook: {failure}");
        }
        for crash in &result.worker_crashes {
            let _ = writeln!(notes, " crash: {crash}");
        }
        if result.interrupted {
            let _ = writeln!(
                notes,
                " Interrupted: {} unfinished, {} not run",
                result.unfinished.len(),
                result.not_run
            );
            for id in &result.unfinished {
                let _ = writeln!(notes, "   - {id}");
            }
        }
        for message in &result.diagnostics {
            let _ = writeln!(notes, " note: {message}");
        }
        notes
    }

    fn status_word(&self, result: &RunResult) -> String {
        match (result.was_successful(), self.colorize) {
            (true, true) => "\x1b[32mOK\x1b[0m".to_string(),
            (true, false) => "OK".to_string(),
            (false, true) => "\x1b[31mFAILED\x1b[0m".to_string(),
            (false, false) => "FAILED".to_string(),
        }
    }

    fn format_csv(&self, result: &RunResult) -> String {
        let mut writer = csv::Writer::from_writer(Vec::new());
        for outcome in result.outcomes() {
            let row = CsvRow {
                id: &outcome.item.id,
                group: &outcome.item.group,
                name: &outcome.item.name,
                verdict: outcome.verdict.to_string(),
                duration_ms: outcome.duration_ms,
                worker_pid: outcome.worker_pid,
                detail: outcome.detail.as_deref().unwrap_or(""),
            };
            if writer.serialize(row).is_err() {
                return String::new();
            }
        }
        writer
            .into_inner()
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default()
    }

    fn format_summary(&self, result: &RunResult) -> String {
        format!("{} => {}", result, self.status_word(result))
    }

    /// Indented listing of a discovered tree
    pub fn format_tree(&self, tree: &WorkTree) -> String {
        let mut output = String::new();
        for module in &tree.modules {
            self.tree_group(&mut output, module, 0);
        }
        let _ = writeln!(
            output,
            "\n{} item(s) in {} module(s)",
            tree.item_count(),
            tree.modules.len()
        );
        output
    }

    fn tree_group(&self, output: &mut String, group: &WorkGroup, depth: usize) {
        let indent = "  ".repeat(depth);
        let mut marks = Vec::new();
        if group.setup.is_some() {
            marks.push("setup");
        }
        if group.teardown.is_some() {
            marks.push("teardown");
        }
        if marks.is_empty() {
            let _ = writeln!(output, "{indent}{}", group.id);
        } else {
            let _ = writeln!(output, "{indent}{} ({})", group.id, marks.join(", "));
        }
        for member in &group.members {
            match member {
                WorkNode::Item(item) => match &item.kind {
                    ItemKind::Case(_) => {
                        let _ = writeln!(output, "{indent}  {}", item.name);
                    }
                    ItemKind::LoadFailure { message } => {
                        let _ = writeln!(output, "{indent}  {} ({message})", item.name);
                    }
                },
                WorkNode::Group(inner) => self.tree_group(output, inner, depth + 1),
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

/// Write a formatted result to a file
pub fn write_result_to_file(
    path: &Path,
    result: &RunResult,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_result(result);
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write report to {}", path.display()))
}
