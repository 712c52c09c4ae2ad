// SPDX-License-Identifier: Apache-2.0

//! Branching multicast (fan-out): splits one pipe into K independently
//! consumable pipes.
//!
//! A single internal reader task drains the source pipe exactly once and
//! offers each item to every subscriber's bounded queue, so a slow branch
//! applies backpressure all the way to the source without starving the
//! other branches (the reader blocks on whichever queue is full, same
//! "producer task feeds per-consumer queue" shape as [`crate::merge`]).

use crate::pipe::{BoxedPipe, Pipe, StreamingPipe};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Snapshot of a multicast's runtime statistics, stored in the pipeline
/// context keyed `BranchMetrics::<nodeId>`.
#[derive(Debug, Clone, Default)]
pub struct BranchMetrics {
    /// Number of downstream subscribers.
    pub subscriber_count: usize,
    /// Configured bounded capacity of each subscriber queue.
    pub per_subscriber_capacity: usize,
    /// High-water mark of outstanding (sent, not-yet-consumed) items across
    /// all subscribers.
    pub max_aggregate_backlog: usize,
    /// Number of subscribers that have fully drained their queue.
    pub subscribers_completed: usize,
    /// Whether the source (or a subscriber) faulted, ending the multicast.
    pub faulted: bool,
}

struct SharedMetrics {
    per_subscriber_capacity: usize,
    subscriber_count: usize,
    outstanding: Vec<AtomicUsize>,
    completed: AtomicUsize,
    faulted: AtomicBool,
    max_backlog: AtomicUsize,
}

impl SharedMetrics {
    fn snapshot(&self) -> BranchMetrics {
        BranchMetrics {
            subscriber_count: self.subscriber_count,
            per_subscriber_capacity: self.per_subscriber_capacity,
            max_aggregate_backlog: self.max_backlog.load(Ordering::Relaxed),
            subscribers_completed: self.completed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
        }
    }

    fn record_send(&self, branch: usize) {
        self.outstanding[branch].fetch_add(1, Ordering::Relaxed);
        let total: usize = self.outstanding.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        self.max_backlog.fetch_max(total, Ordering::Relaxed);
    }

    /// Called when a subscriber actually consumes an item, so
    /// `max_aggregate_backlog` tracks the true sent-minus-consumed
    /// high-water mark rather than a monotonically growing sent count.
    fn record_consume(&self, branch: usize) {
        self.outstanding[branch].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1))).ok();
    }

    /// Called once per subscriber when its pipe is exhausted or disposed.
    fn record_subscriber_done(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wraps a subscriber's receiving half so that every yielded item decrements
/// the shared outstanding count for its branch, and the subscriber is
/// counted as completed exactly once, whenever it first observes end of
/// stream or is disposed early.
struct BranchSubscriberPipe<T> {
    inner: StreamingPipe<T>,
    branch: usize,
    metrics: Arc<SharedMetrics>,
    done: bool,
}

impl<T: Send + 'static> BranchSubscriberPipe<T> {
    fn mark_done_once(&mut self) {
        if !self.done {
            self.done = true;
            self.metrics.record_subscriber_done();
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Pipe<T> for BranchSubscriberPipe<T> {
    async fn next(&mut self) -> Option<T> {
        let item = self.inner.next().await;
        if item.is_some() {
            self.metrics.record_consume(self.branch);
        } else {
            self.mark_done_once();
        }
        item
    }

    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn dispose(&mut self) {
        self.inner.dispose();
        self.mark_done_once();
    }
}

/// A per-node registry of [`BranchMetrics`] snapshots, keyed by node id.
#[derive(Clone, Default)]
pub struct BranchMetricsRegistry {
    inner: Arc<Mutex<std::collections::HashMap<crate::graph::NodeId, Arc<SharedMetrics>>>>,
}

impl BranchMetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        BranchMetricsRegistry::default()
    }

    /// Returns the current metrics snapshot for `node`, if a multicast has
    /// been created for it.
    #[must_use]
    pub fn snapshot(&self, node: &crate::graph::NodeId) -> Option<BranchMetrics> {
        self.inner.lock().get(node).map(|m| m.snapshot())
    }

    fn register(&self, node: crate::graph::NodeId, metrics: Arc<SharedMetrics>) {
        self.inner.lock().insert(node, metrics);
    }
}

/// Splits `source` into `subscriber_count` independent pipes. Each yields
/// the same sequence of items, in source order. If `subscriber_count <= 1`
/// the source is returned unchanged (a no-op passthrough).
pub fn multicast<T: Clone + Send + 'static>(
    node: crate::graph::NodeId,
    mut source: BoxedPipe<T>,
    subscriber_count: usize,
    per_subscriber_capacity: usize,
    metrics_registry: BranchMetricsRegistry,
    cancel: CancellationToken,
) -> Vec<BoxedPipe<T>> {
    if subscriber_count <= 1 {
        return vec![source];
    }

    let capacity = per_subscriber_capacity.max(1);
    let mut senders = Vec::with_capacity(subscriber_count);
    let mut rxs = Vec::with_capacity(subscriber_count);
    for i in 0..subscriber_count {
        let (tx, rx) = StreamingPipe::channel(format!("{}-branch-{i}", source.stream_name()), capacity);
        senders.push(tx);
        rxs.push(rx);
    }

    let metrics = Arc::new(SharedMetrics {
        per_subscriber_capacity: capacity,
        subscriber_count,
        outstanding: (0..subscriber_count).map(|_| AtomicUsize::new(0)).collect(),
        completed: AtomicUsize::new(0),
        faulted: AtomicBool::new(false),
        max_backlog: AtomicUsize::new(0),
    });
    metrics_registry.register(node, metrics.clone());

    let pipes = rxs
        .into_iter()
        .enumerate()
        .map(|(i, rx)| {
            Box::new(BranchSubscriberPipe {
                inner: rx,
                branch: i,
                metrics: metrics.clone(),
                done: false,
            }) as BoxedPipe<T>
        })
        .collect();

    tokio::spawn(async move {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    metrics.faulted.store(true, Ordering::Relaxed);
                    break;
                }
                item = source.next() => item,
            };
            let Some(item) = item else { break };
            for (i, tx) in senders.iter().enumerate() {
                metrics.record_send(i);
                if tx.send(item.clone()).await.is_err() {
                    metrics.faulted.store(true, Ordering::Relaxed);
                }
            }
        }
        source.dispose();
        // Dropping `senders` here closes every subscriber channel; each
        // subscriber pipe marks itself completed the next time it observes
        // end of stream (or is disposed early), not all at once.
    });

    pipes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{drain_to_vec, InMemoryPipe};

    #[tokio::test]
    async fn single_subscriber_is_passthrough() {
        let source: BoxedPipe<i32> = Box::new(InMemoryPipe::new("s", vec![1, 2, 3]));
        let branches = multicast(
            crate::graph::NodeId::new("n"),
            source,
            1,
            4,
            BranchMetricsRegistry::new(),
            CancellationToken::new(),
        );
        assert_eq!(branches.len(), 1);
        assert_eq!(drain_to_vec(branches.into_iter().next().unwrap()).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn every_branch_observes_the_full_sequence_in_order() {
        let source: BoxedPipe<i32> = Box::new(InMemoryPipe::new("s", vec![1, 2, 3, 4]));
        let registry = BranchMetricsRegistry::new();
        let branches = multicast(
            crate::graph::NodeId::new("n"),
            source,
            3,
            8,
            registry.clone(),
            CancellationToken::new(),
        );
        let mut handles = Vec::new();
        for branch in branches {
            handles.push(tokio::spawn(drain_to_vec(branch)));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), vec![1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn backpressure_bounds_outstanding_items_per_branch() {
        let source: BoxedPipe<i32> = Box::new(InMemoryPipe::new("s", (0..20).collect()));
        let registry = BranchMetricsRegistry::new();
        let node = crate::graph::NodeId::new("n");
        let branches = multicast(node.clone(), source, 2, 2, registry.clone(), CancellationToken::new());
        let mut iter = branches.into_iter();
        let fast = iter.next().unwrap();
        let slow = iter.next().unwrap();
        let fast_handle = tokio::spawn(drain_to_vec(fast));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let snapshot = registry.snapshot(&node).expect("metrics registered");
        assert!(snapshot.max_aggregate_backlog <= 2 * snapshot.per_subscriber_capacity + 2);
        let slow_handle = tokio::spawn(drain_to_vec(slow));
        let fast_items = fast_handle.await.unwrap();
        let slow_items = slow_handle.await.unwrap();
        assert_eq!(fast_items, slow_items);
    }

    #[tokio::test]
    async fn outstanding_backlog_reflects_consumption_not_monotonic_sends() {
        let source: BoxedPipe<i32> = Box::new(InMemoryPipe::new("s", (0..50).collect()));
        let registry = BranchMetricsRegistry::new();
        let node = crate::graph::NodeId::new("n");
        let branches = multicast(node.clone(), source, 2, 2, registry.clone(), CancellationToken::new());
        let mut iter = branches.into_iter();
        let fast = iter.next().unwrap();
        let slow = iter.next().unwrap();

        // Drain the fast branch fully while the slow branch never reads; the
        // reader stalls on the slow branch's bounded queue once full, so
        // sends past that point don't happen yet.
        let fast_items = drain_to_vec(fast).await;
        assert_eq!(fast_items.len(), 50);

        let snapshot = registry.snapshot(&node).expect("metrics registered");
        // Had outstanding never been decremented on consume, this would have
        // climbed toward 50 once the fast branch finished draining; instead
        // it reflects only the still-unconsumed backlog across branches.
        assert!(
            snapshot.max_aggregate_backlog <= 2 * snapshot.per_subscriber_capacity + 2,
            "backlog should track sent-minus-consumed, not total sends: {snapshot:?}"
        );
        assert_eq!(snapshot.subscribers_completed, 1, "only the fast branch has drained so far");

        let slow_items = drain_to_vec(slow).await;
        assert_eq!(slow_items, fast_items);
        let final_snapshot = registry.snapshot(&node).unwrap();
        assert_eq!(final_snapshot.subscribers_completed, 2);
    }
}
