//! Live progress on stderr

use std::io::{self, Write};

use super::Reporter;
use crate::models::{ItemOutcome, ItemRef, RunResult};

/// Prints one symbol per verdict, or one line per item when verbose
pub struct ProgressReporter {
    out: Box<dyn Write + Send>,
    verbose: bool,
    printed: usize,
}

impl ProgressReporter {
    pub fn stderr(verbose: bool) -> Self {
        Self::to_writer(Box::new(io::stderr()), verbose)
    }

    pub fn to_writer(out: Box<dyn Write + Send>, verbose: bool) -> Self {
        Self {
            out,
            verbose,
            printed: 0,
        }
    }
}

impl Reporter for ProgressReporter {
    fn on_started(&mut self, item: &ItemRef, _partial: &RunResult) {
        if self.verbose {
            let _ = writeln!(self.out, "{item} ...");
        }
    }

    fn on_completed(&mut self, outcome: &ItemOutcome, _partial: &RunResult) {
        let _ = if self.verbose {
            writeln!(self.out, "{outcome}")
        } else {
            write!(self.out, "{}", outcome.verdict.symbol())
        };
        let _ = self.out.flush();
        self.printed += 1;
    }

    fn on_finished(&mut self, _result: &RunResult) {
        if !self.verbose && self.printed > 0 {
            let _ = writeln!(self.out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Shared {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn test_symbols_then_newline() {
        let sink = Shared::default();
        let mut reporter = ProgressReporter::to_writer(Box::new(sink.clone()), false);
        let partial = RunResult::new(Utc::now());
        let a = ItemRef::from_id("m.a");
        reporter.on_started(&a, &partial);
        reporter.on_completed(&ItemOutcome::passed(a, 1), &partial);
        reporter.on_completed(&ItemOutcome::failed(ItemRef::from_id("m.b"), "exit status 1"), &partial);
        reporter.on_finished(&partial);
        assert_eq!(sink.text(), ".F\n");
    }

    #[test]
    fn test_verbose_lines() {
        let sink = Shared::default();
        let mut reporter = ProgressReporter::to_writer(Box::new(sink.clone()), true);
        let partial = RunResult::new(Utc::now());
        let a = ItemRef::from_id("m.a");
        reporter.on_started(&a, &partial);
        reporter.on_completed(&ItemOutcome::passed(a, 1), &partial);
        let text = sink.text();
        assert!(text.starts_with("m.a ...\n"));
        assert!(text.contains("m.a"));
        assert_eq!(text.lines().count(), 2);
    }
}
