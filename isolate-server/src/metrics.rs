//! Process-wide observability counters, registered the way the
//! reference codebase's services build a `metrics::register_all()`
//! that returns a `prometheus::Registry` for the binary to expose.
//!
//! This service's external interface (see the wire protocol) is gRPC
//! plus the standard health/reflection services only - there is no
//! HTTP listener to mount a `/metrics` scrape endpoint on, unlike the
//! corpus's `poem`-fronted services. The registry is still built and
//! populated so a future HTTP surface (or a sidecar that scrapes via
//! the health port) has something to attach to; see DESIGN.md.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub tasks_submitted: IntCounter,
    pub tasks_completed: IntCounterVec,
    /// Only `Submit`-registered tasks are tracked here, matching the
    /// "only Submit-tasks appear in List" rule - a synchronous `Run`
    /// never touches this gauge.
    pub active_tasks: IntGauge,
}

impl Metrics {
    /// Called once a `Submit`ted task has been registered in the task
    /// registry and is about to start running.
    pub fn record_submission(&self) {
        self.tasks_submitted.inc();
        self.active_tasks.inc();
    }

    /// Called once a `Submit`ted task reaches a terminal state.
    pub fn record_task_completion(&self, outcome: &str) {
        self.tasks_completed.with_label_values(&[outcome]).inc();
        self.active_tasks.dec();
    }

    /// Called once a synchronous `Run` call's pipeline reaches a
    /// terminal state. Doesn't touch `active_tasks`: a `Run` was never
    /// registered as a background task in the first place.
    pub fn record_run_completion(&self, outcome: &str) {
        self.tasks_completed.with_label_values(&[outcome]).inc();
    }
}

/// Builds a fresh registry and the counters registered into it. Called
/// once at process startup; tests construct their own instance instead
/// of reaching for a global.
pub fn register_all() -> (Registry, Metrics) {
    let registry = Registry::new();

    let tasks_submitted = IntCounter::new(
        "isolate_tasks_submitted_total",
        "Background tasks accepted via Submit",
    )
    .expect("static metric description is valid");

    let tasks_completed = IntCounterVec::new(
        Opts::new(
            "isolate_tasks_completed_total",
            "Run and Submit pipelines that reached a terminal state, by outcome",
        ),
        &["outcome"],
    )
    .expect("static metric description is valid");

    let active_tasks = IntGauge::new(
        "isolate_active_background_tasks",
        "Submit-registered tasks that have not yet reached a terminal state",
    )
    .expect("static metric description is valid");

    registry
        .register(Box::new(tasks_submitted.clone()))
        .expect("metric name is unique within this registry");
    registry
        .register(Box::new(tasks_completed.clone()))
        .expect("metric name is unique within this registry");
    registry
        .register(Box::new(active_tasks.clone()))
        .expect("metric name is unique within this registry");

    (
        registry,
        Metrics {
            tasks_submitted,
            tasks_completed,
            active_tasks,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_completed_is_labeled_by_outcome() {
        let (_, metrics) = register_all();
        metrics.record_run_completion("completed");
        metrics.record_run_completion("cancelled");
        metrics.record_run_completion("completed");

        assert_eq!(metrics.tasks_completed.with_label_values(&["completed"]).get(), 2);
        assert_eq!(metrics.tasks_completed.with_label_values(&["cancelled"]).get(), 1);
    }

    #[test]
    fn submission_and_completion_keep_the_active_gauge_balanced() {
        let (_, metrics) = register_all();
        metrics.record_submission();
        metrics.record_submission();
        assert_eq!(metrics.active_tasks.get(), 2);

        metrics.record_task_completion("completed");
        assert_eq!(metrics.active_tasks.get(), 1);
        assert_eq!(metrics.tasks_submitted.get(), 2);
    }

    #[test]
    fn run_completion_does_not_move_the_active_gauge() {
        let (_, metrics) = register_all();
        metrics.record_run_completion("completed");
        assert_eq!(metrics.active_tasks.get(), 0);
    }
}
