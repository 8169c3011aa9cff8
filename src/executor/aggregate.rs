//! Result aggregation
//!
//! Builds the [`RunResult`] incrementally from events in arrival order.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::warn;

use crate::models::{
    DiscoveryFailure, HookFailure, ItemId, ItemOutcome, ItemRef, RunResult, WorkerCrash,
};

pub struct Aggregator {
    result: RunResult,
    in_flight: Vec<ItemRef>,
    completed: HashSet<ItemId>,
}

impl Aggregator {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            result: RunResult::new(started_at),
            in_flight: Vec::new(),
            completed: HashSet::new(),
        }
    }

    /// Partial result so far
    pub fn result(&self) -> &RunResult {
        &self.result
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    pub fn is_started(&self, id: &str) -> bool {
        self.in_flight.iter().any(|item| item.id == id)
    }

    /// Returns false for an item that already has a verdict
    pub fn started(&mut self, item: &ItemRef) -> bool {
        if self.completed.contains(&item.id) || self.is_started(&item.id) {
            return false;
        }
        self.in_flight.push(item.clone());
        true
    }

    /// Route an outcome into its bucket; a second outcome for the same item is dropped
    pub fn completed(&mut self, outcome: ItemOutcome) -> bool {
        if !self.completed.insert(outcome.item.id.clone()) {
            warn!(
                "Dropping duplicate outcome for {} ({})",
                outcome.item, outcome.verdict
            );
            self.result
                .diagnostics
                .push(format!("duplicate outcome for {} dropped", outcome.item));
            return false;
        }
        self.in_flight.retain(|item| item.id != outcome.item.id);
        if !outcome.item.fixture {
            self.result.tests_run += 1;
        }
        self.result.bucket_mut(outcome.verdict).push(outcome);
        true
    }

    pub fn discovery_failed(&mut self, failure: DiscoveryFailure) {
        self.result.discovery_failures.push(failure);
    }

    pub fn hook_failed(&mut self, failure: HookFailure) {
        self.result.hook_failures.push(failure);
    }

    pub fn worker_crashed(&mut self, crash: WorkerCrash) {
        self.result.worker_crashes.push(crash);
    }

    pub fn diagnostic(&mut self, message: impl Into<String>) {
        self.result.diagnostics.push(message.into());
    }

    /// Seal the result. Items still in flight become `unfinished`.
    pub fn finish(mut self, elapsed_ms: u64, interrupted: bool, not_run: usize) -> RunResult {
        self.result.elapsed_ms = elapsed_ms;
        self.result.interrupted = interrupted;
        self.result.not_run = not_run;
        self.result.unfinished = self
            .in_flight
            .into_iter()
            .map(|item| item.id)
            .collect();
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FixturePhase, Verdict};

    fn item(name: &str) -> ItemRef {
        ItemRef::new(format!("m.{name}"), name, "m")
    }

    #[test]
    fn test_buckets_keep_arrival_order() {
        let mut agg = Aggregator::new(Utc::now());
        agg.completed(ItemOutcome::passed(item("b"), 1));
        agg.completed(ItemOutcome::failed(item("c"), "exit status 1"));
        agg.completed(ItemOutcome::passed(item("a"), 1));

        let result = agg.finish(10, false, 0);
        let passing: Vec<&str> = result.passing.iter().map(|o| o.item.name.as_str()).collect();
        assert_eq!(passing, ["b", "a"]);
        assert_eq!(result.count(Verdict::Failed), 1);
        assert_eq!(result.tests_run, 3);
        assert_eq!(result.elapsed_ms, 10);
    }

    #[test]
    fn test_duplicate_completion_dropped() {
        let mut agg = Aggregator::new(Utc::now());
        assert!(agg.completed(ItemOutcome::passed(item("a"), 1)));
        assert!(!agg.completed(ItemOutcome::error(item("a"), "late")));
        let result = agg.finish(0, false, 0);
        assert_eq!(result.tests_run, 1);
        assert!(result.errors.is_empty());
        assert_eq!(result.diagnostics.len(), 1);
    }

    #[test]
    fn test_fixture_entries_not_counted_as_tests() {
        let mut agg = Aggregator::new(Utc::now());
        agg.completed(ItemOutcome::error(
            ItemRef::fixture("m.G", FixturePhase::Setup),
            "setup failed",
        ));
        agg.completed(ItemOutcome::skipped(item("x"), "setup of m.G failed"));
        let result = agg.finish(0, false, 0);
        assert_eq!(result.tests_run, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.was_successful());
    }

    #[test]
    fn test_unfinished_items_listed() {
        let mut agg = Aggregator::new(Utc::now());
        assert!(agg.started(&item("slow")));
        assert!(!agg.started(&item("slow")));
        agg.started(&item("quick"));
        agg.completed(ItemOutcome::passed(item("quick"), 1));
        assert!(agg.is_started("m.slow"));
        assert!(agg.is_completed("m.quick"));

        let result = agg.finish(0, true, 2);
        assert_eq!(result.unfinished, ["m.slow"]);
        assert_eq!(result.not_run, 2);
        assert!(result.interrupted);
        assert!(!result.was_successful());
    }
}
