// SPDX-License-Identifier: Apache-2.0

//! Observability surface: the `ExecutionObserver` event
//! sink, the per-node auto-observability scope, and pipeline-level
//! metrics aggregation. Built on plain `tracing` instrumentation plus an
//! injectable `ExecutionObserver` trait for callers that want structured
//! events rather than (or in addition to) log lines.

use crate::error::RunError;
use crate::graph::NodeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Lifecycle and backpressure events emitted around node execution. All
/// methods have a default no-op body so implementors only need to
/// override what they care about.
pub trait ExecutionObserver: Send + Sync {
    /// A node began executing.
    fn node_started(&self, _node: &NodeId, _start: Instant) {}

    /// A node finished executing (successfully or not).
    fn node_completed(&self, _node: &NodeId, _duration: Duration, _success: bool, _error: Option<&RunError>) {}

    /// A node is about to retry after a failed attempt.
    fn node_retry(&self, _node: &NodeId, _attempt: u32, _error: &RunError) {}

    /// A bounded queue (merge or branch) dropped or rejected an item.
    fn queue_drop(&self, _node: &NodeId, _context: &str) {}

    /// A bounded queue's backlog/throughput metrics changed materially.
    fn queue_metrics(&self, _node: &NodeId, _backlog: usize, _capacity: usize) {}
}

/// An [`ExecutionObserver`] that logs every event at `tracing` level
/// `info`/`warn`/`debug` and otherwise does nothing; the default observer
/// when a run doesn't register one of its own.
pub struct TracingExecutionObserver;

impl ExecutionObserver for TracingExecutionObserver {
    fn node_started(&self, node: &NodeId, _start: Instant) {
        info!(node = %node, "node started");
    }

    fn node_completed(&self, node: &NodeId, duration: Duration, success: bool, error: Option<&RunError>) {
        if success {
            info!(node = %node, duration_ms = duration.as_millis() as u64, "node completed");
        } else {
            warn!(node = %node, duration_ms = duration.as_millis() as u64, error = ?error.map(ToString::to_string), "node failed");
        }
    }

    fn node_retry(&self, node: &NodeId, attempt: u32, error: &RunError) {
        warn!(node = %node, attempt, error = %error, "node retrying");
    }

    fn queue_drop(&self, node: &NodeId, context: &str) {
        warn!(node = %node, context, "queue drop");
    }

    fn queue_metrics(&self, node: &NodeId, backlog: usize, capacity: usize) {
        tracing::debug!(node = %node, backlog, capacity, "queue metrics");
    }
}

/// An [`ExecutionObserver`] that discards every event, used when the run
/// is configured with no collector at all.
pub struct NullExecutionObserver;

impl ExecutionObserver for NullExecutionObserver {}

/// An [`ExecutionObserver`] that records every event in memory, for test
/// assertions.
#[derive(Default)]
pub struct RecordingExecutionObserver {
    events: parking_lot::Mutex<Vec<ObservedEvent>>,
}

/// One recorded event, for test assertions.
#[derive(Debug, Clone)]
pub enum ObservedEvent {
    /// A node started.
    Started(NodeId),
    /// A node completed.
    Completed { node: NodeId, success: bool },
    /// A node retried.
    Retry { node: NodeId, attempt: u32 },
    /// A queue dropped an item.
    QueueDrop { node: NodeId, context: String },
}

impl RecordingExecutionObserver {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        RecordingExecutionObserver::default()
    }

    /// Returns a snapshot of all events recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    /// Counts how many `NodeRetry` events were recorded for `node`.
    #[must_use]
    pub fn retry_count(&self, node: &NodeId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, ObservedEvent::Retry { node: n, .. } if n == node))
            .count()
    }
}

impl ExecutionObserver for RecordingExecutionObserver {
    fn node_started(&self, node: &NodeId, _start: Instant) {
        self.events.lock().push(ObservedEvent::Started(node.clone()));
    }

    fn node_completed(&self, node: &NodeId, _duration: Duration, success: bool, _error: Option<&RunError>) {
        self.events.lock().push(ObservedEvent::Completed {
            node: node.clone(),
            success,
        });
    }

    fn node_retry(&self, node: &NodeId, attempt: u32, _error: &RunError) {
        self.events.lock().push(ObservedEvent::Retry {
            node: node.clone(),
            attempt,
        });
    }

    fn queue_drop(&self, node: &NodeId, context: &str) {
        self.events.lock().push(ObservedEvent::QueueDrop {
            node: node.clone(),
            context: context.to_owned(),
        });
    }
}

/// Per-node counters backing the auto-observability scope, stored in the context keyed `NodeObservabilityScope::<nodeId>`.
pub struct NodeObservabilityScope {
    node: NodeId,
    started_at: Instant,
    items_in: AtomicU64,
    items_out: AtomicU64,
    failures: AtomicU64,
}

impl NodeObservabilityScope {
    /// Opens a new scope for `node`, starting its elapsed-time clock.
    #[must_use]
    pub fn open(node: NodeId) -> Self {
        NodeObservabilityScope {
            node,
            started_at: Instant::now(),
            items_in: AtomicU64::new(0),
            items_out: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Records one item entering the node.
    pub fn record_item_in(&self) {
        self.items_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one item successfully emitted by the node.
    pub fn record_item_out(&self) {
        self.items_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed invocation.
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Computes the derived metrics at the current instant.
    #[must_use]
    pub fn metrics(&self) -> NodeMetrics {
        let elapsed = self.started_at.elapsed();
        let items_out = self.items_out.load(Ordering::Relaxed);
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            items_out as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_ms_per_item = if items_out > 0 {
            elapsed.as_secs_f64() * 1000.0 / items_out as f64
        } else {
            0.0
        };
        NodeMetrics {
            node: self.node.clone(),
            elapsed,
            items_in: self.items_in.load(Ordering::Relaxed),
            items_out,
            failures: self.failures.load(Ordering::Relaxed),
            throughput_items_per_sec: throughput,
            avg_ms_per_item,
        }
    }
}

/// Derived per-node metrics, folded into [`PipelineMetrics::per_node`].
#[derive(Debug, Clone)]
pub struct NodeMetrics {
    /// The node these metrics describe.
    pub node: NodeId,
    /// Wall-clock time the node's scope was open.
    pub elapsed: Duration,
    /// Items that entered the node.
    pub items_in: u64,
    /// Items the node emitted.
    pub items_out: u64,
    /// Failed invocations recorded (including retried ones).
    pub failures: u64,
    /// `items_out / elapsed.as_secs_f64()`.
    pub throughput_items_per_sec: f64,
    /// `elapsed_ms / items_out`, `0.0` if no items were emitted.
    pub avg_ms_per_item: f64,
}

/// Pipeline-wide metrics for one completed run.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// The pipeline's configured name.
    pub name: String,
    /// The run's unique id.
    pub run_id: uuid::Uuid,
    /// When the run started.
    pub start: Instant,
    /// Total wall-clock duration of the run.
    pub duration: Duration,
    /// Whether the run completed successfully.
    pub success: bool,
    /// Total items counted across every node (the `TotalProcessedItems`
    /// counter).
    pub total_items_processed: u64,
    /// Per-node derived metrics.
    pub per_node: Vec<NodeMetrics>,
}

/// A sink that receives [`PipelineMetrics`] at the end of a run.
pub trait PipelineMetricsSink: Send + Sync {
    /// Receives the metrics for one completed run.
    fn emit(&self, metrics: &PipelineMetrics);
}

/// A [`PipelineMetricsSink`] that logs a summary line via `tracing`.
pub struct TracingPipelineMetricsSink;

impl PipelineMetricsSink for TracingPipelineMetricsSink {
    fn emit(&self, metrics: &PipelineMetrics) {
        info!(
            pipeline = %metrics.name,
            run_id = %metrics.run_id,
            duration_ms = metrics.duration.as_millis() as u64,
            success = metrics.success,
            total_items = metrics.total_items_processed,
            nodes = metrics.per_node.len(),
            "pipeline run complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_computes_throughput_from_recorded_items() {
        let scope = NodeObservabilityScope::open(NodeId::new("n"));
        scope.record_item_in();
        scope.record_item_in();
        scope.record_item_out();
        scope.record_item_out();
        std::thread::sleep(Duration::from_millis(5));
        let metrics = scope.metrics();
        assert_eq!(metrics.items_in, 2);
        assert_eq!(metrics.items_out, 2);
        assert!(metrics.throughput_items_per_sec > 0.0);
    }

    #[test]
    fn recording_observer_counts_retries_per_node() {
        let observer = RecordingExecutionObserver::new();
        let n = NodeId::new("n");
        let err = RunError::Internal {
            message: "x".to_owned(),
        };
        observer.node_retry(&n, 1, &err);
        observer.node_retry(&n, 2, &err);
        observer.node_retry(&NodeId::new("other"), 1, &err);
        assert_eq!(observer.retry_count(&n), 2);
    }
}
