// SPDX-License-Identifier: Apache-2.0

//! The data pipe: a lazy, forward-only, typed async sequence.
//!
//! A [`Pipe<T>`] is consumed by repeatedly calling [`Pipe::next`] until it
//! returns `None`. Streaming pipes wrap a channel receiver fed by a producer
//! task (the common case); in-memory pipes wrap a finite, clonable list and
//! may be iterated more than once.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A lazy, forward-only async sequence of `T`.
///
/// Implementors are `!Clone`: a pipe is consumed at most once along its
/// primary path. Branching (see [`crate::branch`]) is how a pipe is turned
/// into several independently consumable pipes.
#[async_trait]
pub trait Pipe<T: Send + 'static>: Send {
    /// Pulls the next item, or `None` if the pipe is exhausted.
    async fn next(&mut self) -> Option<T>;

    /// A human-readable name for this pipe, used in observability and
    /// error messages.
    fn stream_name(&self) -> &str;

    /// Releases any resources held by this pipe (closes the underlying
    /// channel, drops buffered producer tasks). Idempotent.
    fn dispose(&mut self) {}
}

/// A streaming pipe backed by a bounded channel fed by a producer task.
///
/// The producer task is spawned by whoever constructs this pipe (the
/// execution strategies, the merge service, the branching multicast); this
/// type only owns the consuming half.
pub struct StreamingPipe<T> {
    name: Arc<str>,
    receiver: tokio::sync::mpsc::Receiver<T>,
    disposed: bool,
}

impl<T: Send + 'static> StreamingPipe<T> {
    /// Wraps a channel receiver as a named streaming pipe.
    pub fn new(name: impl Into<Arc<str>>, receiver: tokio::sync::mpsc::Receiver<T>) -> Self {
        StreamingPipe {
            name: name.into(),
            receiver,
            disposed: false,
        }
    }

    /// Creates a bounded streaming pipe and returns both ends: the sender
    /// for a producer task and the pipe itself for the consumer.
    #[must_use]
    pub fn channel(
        name: impl Into<Arc<str>>,
        capacity: usize,
    ) -> (tokio::sync::mpsc::Sender<T>, StreamingPipe<T>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        (tx, StreamingPipe::new(name, rx))
    }
}

#[async_trait]
impl<T: Send + 'static> Pipe<T> for StreamingPipe<T> {
    async fn next(&mut self) -> Option<T> {
        if self.disposed {
            return None;
        }
        self.receiver.recv().await
    }

    fn stream_name(&self) -> &str {
        &self.name
    }

    fn dispose(&mut self) {
        self.disposed = true;
        self.receiver.close();
    }
}

/// A finite, in-memory pipe. Used for aggregate results that happen to be
/// fully materialized, and in tests.
pub struct InMemoryPipe<T> {
    name: Arc<str>,
    items: std::vec::IntoIter<T>,
}

impl<T: Send + 'static> InMemoryPipe<T> {
    /// Wraps a `Vec<T>` as a named in-memory pipe.
    pub fn new(name: impl Into<Arc<str>>, items: Vec<T>) -> Self {
        InMemoryPipe {
            name: name.into(),
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Pipe<T> for InMemoryPipe<T> {
    async fn next(&mut self) -> Option<T> {
        self.items.next()
    }

    fn stream_name(&self) -> &str {
        &self.name
    }
}

/// A boxed, dynamically-dispatched pipe, used wherever the concrete pipe
/// implementation varies by node kind (streaming producer vs. in-memory
/// aggregate result).
pub type BoxedPipe<T> = Box<dyn Pipe<T>>;

/// Shared atomic counter backing `TotalProcessedItems` in the pipeline
/// context.
#[derive(Debug, Default)]
pub struct StatsCounter(AtomicU64);

impl StatsCounter {
    /// Creates a zeroed counter.
    #[must_use]
    pub fn new() -> Self {
        StatsCounter(AtomicU64::new(0))
    }

    /// Atomically increments the counter and returns the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reads the current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Wraps a pipe so that every item passing through increments a shared
/// [`StatsCounter`]. Does not change ordering or element identity.
pub struct CountingPipe<T> {
    inner: BoxedPipe<T>,
    counter: Arc<StatsCounter>,
}

impl<T: Send + 'static> CountingPipe<T> {
    /// Wraps `inner`, incrementing `counter` once per yielded item.
    pub fn new(inner: BoxedPipe<T>, counter: Arc<StatsCounter>) -> Self {
        CountingPipe { inner, counter }
    }
}

#[async_trait]
impl<T: Send + 'static> Pipe<T> for CountingPipe<T> {
    async fn next(&mut self) -> Option<T> {
        let item = self.inner.next().await;
        if item.is_some() {
            let _ = self.counter.increment();
        }
        item
    }

    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

/// Drains an entire pipe into a `Vec`, used by sinks that collect and by
/// tests. Not part of the public engine contract for production sinks
/// (which should stream), but a convenient building block.
pub async fn drain_to_vec<T: Send + 'static>(mut pipe: BoxedPipe<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Some(item) = pipe.next().await {
        out.push(item);
    }
    pipe.dispose();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_pipe_yields_items_in_order() {
        let pipe: BoxedPipe<i32> = Box::new(InMemoryPipe::new("test", vec![1, 2, 3]));
        assert_eq!(drain_to_vec(pipe).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn counting_pipe_increments_once_per_item() {
        let counter = Arc::new(StatsCounter::new());
        let inner: BoxedPipe<i32> = Box::new(InMemoryPipe::new("test", vec![1, 2, 3]));
        let pipe: BoxedPipe<i32> = Box::new(CountingPipe::new(inner, counter.clone()));
        let items = drain_to_vec(pipe).await;
        assert_eq!(items, vec![1, 2, 3]);
        assert_eq!(counter.get(), 3);
    }

    #[tokio::test]
    async fn streaming_pipe_delivers_producer_order() {
        let (tx, pipe) = StreamingPipe::channel("test", 4);
        tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });
        let items = drain_to_vec(Box::new(pipe)).await;
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }
}
