// SPDX-License-Identifier: Apache-2.0

//! In-crate test doubles: fakes and fixtures shared by this crate's own
//! unit tests and by the integration tests under `tests/`. Always
//! public (not gated behind `#[cfg(test)]`) so downstream crates can
//! reuse them too.

use crate::context::PipelineContext;
use crate::error::RunError;
use crate::error_handling::{DeadLetterSink, ErrorHandlerFactory, NodeDecision, NodeErrorHandler, PipelineDecision, PipelineErrorHandler};
use crate::graph::{NodeDefinition, NodeId};
use crate::node::{Item, Sink, Source, Transform};
use crate::pipe::{BoxedPipe, InMemoryPipe};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// An [`ErrorHandlerFactory`] that resolves nothing, for tests that never
/// register a node-level handler or dead-letter sink.
pub struct NoHandlersFactory;

impl ErrorHandlerFactory for NoHandlersFactory {
    fn create_error_handler(&self, _type_name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        None
    }

    fn create_dead_letter_sink(&self, _type_name: &str) -> Option<Arc<dyn DeadLetterSink>> {
        None
    }
}

/// An [`ErrorHandlerFactory`] that resolves a single, pre-registered
/// dead-letter sink under one fixed type name, for tests exercising
/// dead-letter routing without a full registry.
pub struct SingleDeadLetterSinkFactory {
    type_name: &'static str,
    sink: Arc<dyn DeadLetterSink>,
}

impl SingleDeadLetterSinkFactory {
    /// Registers `sink` under `type_name`.
    #[must_use]
    pub fn new(type_name: &'static str, sink: Arc<dyn DeadLetterSink>) -> Self {
        SingleDeadLetterSinkFactory { type_name, sink }
    }
}

impl ErrorHandlerFactory for SingleDeadLetterSinkFactory {
    fn create_error_handler(&self, _type_name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        None
    }

    fn create_dead_letter_sink(&self, type_name: &str) -> Option<Arc<dyn DeadLetterSink>> {
        if type_name == self.type_name {
            Some(self.sink.clone())
        } else {
            None
        }
    }
}

/// A [`Source`] that replays a fixed, pre-built `Vec<Out>` and then ends.
pub struct VecSource<Out> {
    items: Mutex<Option<Vec<Out>>>,
}

impl<Out: Item> VecSource<Out> {
    /// Builds a source that yields `items`, in order, exactly once.
    #[must_use]
    pub fn new(items: Vec<Out>) -> Self {
        VecSource {
            items: Mutex::new(Some(items)),
        }
    }
}

#[async_trait]
impl<Out: Item> Source<Out> for VecSource<Out> {
    async fn produce(&self, _ctx: &PipelineContext, _cancel: CancellationToken) -> BoxedPipe<Out> {
        let items = self.items.lock().take().unwrap_or_default();
        Box::new(InMemoryPipe::new("vec-source", items))
    }
}

/// A [`Transform`] wrapping a plain synchronous mapping function.
pub struct MapTransform<F> {
    func: F,
}

impl<F> MapTransform<F> {
    /// Wraps `func` as a transform.
    #[must_use]
    pub fn new(func: F) -> Self {
        MapTransform { func }
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for MapTransform<F>
where
    In: Item,
    Out: Item,
    F: Fn(In) -> Result<Out, RunError> + Send + Sync,
{
    async fn process_item(&self, item: In, _ctx: &PipelineContext, _cancel: &CancellationToken) -> Result<Out, RunError> {
        (self.func)(item)
    }
}

/// A [`Transform`] that fails its first `failures` calls (regardless of
/// item) and then delegates to `Ok`, for retry-then-succeed scenarios.
pub struct FlakyTransform<F> {
    failures_remaining: AtomicU32,
    func: F,
}

impl<F> FlakyTransform<F> {
    /// Builds a transform that fails the first `failures` invocations.
    #[must_use]
    pub fn new(failures: u32, func: F) -> Self {
        FlakyTransform {
            failures_remaining: AtomicU32::new(failures),
            func,
        }
    }
}

#[async_trait]
impl<In, Out, F> Transform<In, Out> for FlakyTransform<F>
where
    In: Item,
    Out: Item,
    F: Fn(In) -> Result<Out, RunError> + Send + Sync,
{
    async fn process_item(&self, item: In, _ctx: &PipelineContext, _cancel: &CancellationToken) -> Result<Out, RunError> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None })
            .is_ok();
        if should_fail {
            return Err(RunError::Internal {
                message: "flaky transform: simulated failure".to_owned(),
            });
        }
        (self.func)(item)
    }
}

/// A [`Sink`] that collects every item it receives, for test assertions.
#[derive(Default)]
pub struct CollectingSink<In> {
    items: Mutex<Vec<In>>,
}

impl<In: Item> CollectingSink<In> {
    /// Creates an empty collecting sink.
    #[must_use]
    pub fn new() -> Self {
        CollectingSink { items: Mutex::new(Vec::new()) }
    }

    /// Returns a snapshot of everything received so far, in order.
    #[must_use]
    pub fn items(&self) -> Vec<In> {
        self.items.lock().clone()
    }
}

#[async_trait]
impl<In: Item> Sink<In> for CollectingSink<In> {
    async fn consume(&self, mut input: BoxedPipe<In>, _ctx: &PipelineContext, cancel: CancellationToken) -> Result<(), RunError> {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = input.next() => item,
            };
            let Some(item) = item else { break };
            self.items.lock().push(item);
        }
        input.dispose();
        Ok(())
    }
}

/// A [`PipelineErrorHandler`] that always returns a fixed decision and
/// records how many times it was consulted.
pub struct FixedPipelineErrorHandler {
    decision: PipelineDecision,
    invocations: AtomicU32,
}

impl FixedPipelineErrorHandler {
    /// Builds a handler that always returns `decision`.
    #[must_use]
    pub fn new(decision: PipelineDecision) -> Self {
        FixedPipelineErrorHandler {
            decision,
            invocations: AtomicU32::new(0),
        }
    }

    /// Number of times [`PipelineErrorHandler::handle`] was called.
    #[must_use]
    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PipelineErrorHandler for FixedPipelineErrorHandler {
    async fn handle(&self, _node: &NodeId, _error: &RunError, _ctx: &PipelineContext) -> PipelineDecision {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

/// A [`NodeErrorHandler`] that always returns a fixed decision, for tests
/// exercising the node-level handler-chain step.
pub struct FixedNodeErrorHandler<Item> {
    decision: NodeDecision,
    _marker: std::marker::PhantomData<fn(Item)>,
}

impl<Item> FixedNodeErrorHandler<Item> {
    /// Builds a handler that always returns `decision`.
    #[must_use]
    pub fn new(decision: NodeDecision) -> Self {
        FixedNodeErrorHandler {
            decision,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait]
impl<I: Send + Sync + 'static> NodeErrorHandler<I> for FixedNodeErrorHandler<I> {
    async fn handle(&self, _node: &NodeDefinition, _item: Option<&I>, _error: &RunError, _ctx: &PipelineContext) -> NodeDecision {
        self.decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::drain_to_vec;

    #[tokio::test]
    async fn vec_source_replays_items_once() {
        let source = VecSource::new(vec![1, 2, 3]);
        let ctx_cancel = CancellationToken::new();
        let pipe = source
            .produce(&test_ctx(), ctx_cancel)
            .await;
        assert_eq!(drain_to_vec(pipe).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn collecting_sink_gathers_every_item_in_order() {
        let sink = CollectingSink::new();
        let input: BoxedPipe<i32> = Box::new(InMemoryPipe::new("in", vec![1, 2, 3]));
        sink.consume(input, &test_ctx(), CancellationToken::new()).await.unwrap();
        assert_eq!(sink.items(), vec![1, 2, 3]);
    }

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(
            "test",
            CancellationToken::new(),
            crate::context::RetryOptions::default(),
            Arc::new(crate::circuit_breaker::CircuitBreakerManager::new(
                crate::circuit_breaker::CircuitBreakerConfig::default(),
                std::time::Duration::from_secs(600),
            )),
            Arc::new(crate::retry_delay::Fixed {
                delay: std::time::Duration::from_millis(1),
            }),
            Arc::new(NoHandlersFactory),
            Arc::new(crate::persistence::NullStateManager),
            Some(Arc::new(crate::observability::NullExecutionObserver)),
        )
    }
}
