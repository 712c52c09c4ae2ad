// SPDX-License-Identifier: Apache-2.0

//! Error-handling service: the retry loop, error-handler chain, and
//! dead-letter routing every node invocation is wrapped in.

use crate::context::PipelineContext;
use crate::error::RunError;
use crate::graph::{NodeDefinition, NodeId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Decision returned by a pipeline-level error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineDecision {
    /// Retry the node (only valid if its strategy is Resilient).
    RestartNode,
    /// Treat this invocation as a no-op success and move on.
    ContinueWithoutNode,
    /// Fail the whole pipeline run.
    FailPipeline,
}

/// Decision returned by a node-level error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDecision {
    /// Retry the current invocation.
    Retry,
    /// Skip the failing item/invocation and continue.
    Skip,
    /// Fail the node (and, transitively, the run).
    Fail,
}

impl From<PipelineDecision> for NodeDecision {
    fn from(decision: PipelineDecision) -> Self {
        match decision {
            PipelineDecision::RestartNode => NodeDecision::Retry,
            PipelineDecision::ContinueWithoutNode => NodeDecision::Skip,
            PipelineDecision::FailPipeline => NodeDecision::Fail,
        }
    }
}

/// A pipeline-wide error handler, consulted before any node-level handler.
#[async_trait]
pub trait PipelineErrorHandler: Send + Sync {
    /// Decides how to proceed after `node` failed with `error`.
    async fn handle(&self, node: &NodeId, error: &RunError, ctx: &PipelineContext) -> PipelineDecision;
}

/// A node-level error handler, registered by type name via
/// [`ErrorHandlerFactory::create_error_handler`].
#[async_trait]
pub trait NodeErrorHandler<Item: Send + 'static>: Send + Sync {
    /// Decides how to proceed after `node` failed processing `item`.
    async fn handle(&self, node: &NodeDefinition, item: Option<&Item>, error: &RunError, ctx: &PipelineContext) -> NodeDecision;
}

/// A type-erased decision step consulted by [`execute_with_retries`] for a
/// node-level handler, bridging the per-node-item-type
/// [`NodeErrorHandler<Item>`] down to something the generic retry loop can
/// call without knowing `Item`. [`crate::plan`] builds one of these per
/// node by closing over the resolved, downcast `Arc<dyn
/// NodeErrorHandler<Item>>`.
#[async_trait]
pub trait NodeHandlerDecider: Send + Sync {
    /// Decides how to proceed after a failure, or `None` if this handler
    /// does not apply (falls through to the default `Fail` decision).
    async fn decide(&self, error: &RunError) -> Option<NodeDecision>;
}

/// A bounded side channel for items dropped by error handling.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Offers a failing item (already debug-formatted, since the sink is
    /// type-erased across node item types) to the sink. Returns an error
    /// if the sink's bounded capacity is exceeded.
    async fn offer(&self, node: &NodeId, item_debug: String, error: &RunError) -> Result<(), RunError>;
}

/// Resolves node-level error handlers and dead-letter sinks by type name.
/// Must never throw for unresolvable or non-conforming types — return
/// `None` instead.
pub trait ErrorHandlerFactory: Send + Sync {
    /// Instantiates the node-level error handler registered under `type_name`,
    /// if any. Handlers are item-type-erased at this layer; the caller
    /// downcasts via the concrete `NodeErrorHandler<Item>` it expects.
    fn create_error_handler(&self, type_name: &str) -> Option<Arc<dyn std::any::Any + Send + Sync>>;

    /// Instantiates the dead-letter sink registered under `type_name`, if
    /// any.
    fn create_dead_letter_sink(&self, type_name: &str) -> Option<Arc<dyn DeadLetterSink>>;
}

/// A bounded in-memory dead-letter sink, the built-in default.
pub struct BoundedDeadLetterSink {
    capacity: usize,
    entries: parking_lot::Mutex<Vec<(NodeId, String)>>,
}

impl BoundedDeadLetterSink {
    /// Creates a sink that holds at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        BoundedDeadLetterSink {
            capacity,
            entries: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Returns a snapshot of all entries currently held.
    #[must_use]
    pub fn entries(&self) -> Vec<(NodeId, String)> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl DeadLetterSink for BoundedDeadLetterSink {
    async fn offer(&self, node: &NodeId, item_debug: String, _error: &RunError) -> Result<(), RunError> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            return Err(RunError::DeadLetterSinkFull {
                node: node.clone(),
                capacity: self.capacity,
            });
        }
        entries.push((node.clone(), item_debug));
        Ok(())
    }
}

/// Outcome of [`execute_with_retries`].
pub enum Outcome<T> {
    /// The body succeeded (possibly after retries), yielding `T`.
    Success(T),
    /// The body's failure was classified as `Skip`: the caller should
    /// treat this invocation as a no-op and move on.
    Skipped,
    /// The run was cancelled while this invocation was in flight or
    /// pending retry. Not an error: the caller should terminate cleanly
    /// without recording a node failure.
    Cancelled,
}

/// Runs `body` under the node's retry/error-handler/dead-letter policy.
/// `body` is re-invoked (via `attempt`, 1-based) until it
/// succeeds, is skipped, fails terminally, or exhausts its retry budget.
///
/// `item_for_dead_letter` lazily renders the failing item for the
/// dead-letter sink (only called when a handler resolves to `Skip` or
/// `Fail` and a sink is registered); it avoids requiring `Item: Debug` on
/// call sites that never fail.
///
/// Cancellation is never reported as a `RunError`: if the run's token is
/// already set (before the call, or observed racing with a failed call),
/// this returns `Ok(Outcome::Cancelled)` rather than manufacturing an
/// error, so callers can terminate cleanly without recording a node
/// failure.
pub async fn execute_with_retries<T, F, Fut>(
    node: &NodeDefinition,
    ctx: &PipelineContext,
    pipeline_handler: Option<&dyn PipelineErrorHandler>,
    node_handler: Option<&dyn NodeHandlerDecider>,
    item_for_dead_letter: impl Fn() -> String,
    mut body: F,
) -> Result<Outcome<T>, RunError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, RunError>>,
{
    let retry_options = ctx.retry_options_for(&node.id);
    let mut attempt: u32 = 1;

    loop {
        if ctx.cancel().is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        match body(attempt).await {
            Ok(value) => return Ok(Outcome::Success(value)),
            Err(error) => {
                if ctx.cancel().is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }

                let decision = classify(node, ctx, pipeline_handler, node_handler, &error).await?;

                if let Some(sink) = ctx.dead_letter_sink(&node.id) {
                    if matches!(decision, NodeDecision::Skip | NodeDecision::Fail) {
                        if let Err(dead_letter_error) = sink.offer(&node.id, item_for_dead_letter(), &error).await {
                            warn!(node = %node.id, error = %dead_letter_error, "dead-letter sink rejected item");
                        }
                    }
                }

                match decision {
                    NodeDecision::Retry => {
                        if attempt >= retry_options.max_node_restart_attempts {
                            let exhausted = RunError::node_execution(node.id.clone(), attempt, Box::new(error));
                            ctx.set_last_retry_exhausted(exhausted.to_string());
                            return Err(exhausted);
                        }
                        if let Some(observer) = ctx.observer() {
                            observer.node_retry(&node.id, attempt, &error);
                        }
                        ctx.retry_delay().wait(attempt, ctx.cancel()).await;
                        attempt += 1;
                        debug!(node = %node.id, attempt, "retrying node invocation");
                    }
                    NodeDecision::Skip => return Ok(Outcome::Skipped),
                    NodeDecision::Fail => {
                        return Err(RunError::node_execution(node.id.clone(), attempt, Box::new(error)));
                    }
                }
            }
        }
    }
}

async fn classify(
    node: &NodeDefinition,
    ctx: &PipelineContext,
    pipeline_handler: Option<&dyn PipelineErrorHandler>,
    node_handler: Option<&dyn NodeHandlerDecider>,
    error: &RunError,
) -> Result<NodeDecision, RunError> {
    if let Some(handler) = pipeline_handler {
        let pipeline_decision = handler.handle(&node.id, error, ctx).await;
        if pipeline_decision == PipelineDecision::RestartNode
            && node.execution_strategy != crate::graph::ExecutionStrategyRef::Resilient
        {
            return Err(RunError::ErrorHandlerConfig {
                node: node.id.clone(),
                message: "pipeline handler requested RestartNode on a non-Resilient node".to_owned(),
            });
        }
        return Ok(pipeline_decision.into());
    }
    if let Some(handler) = node_handler {
        if let Some(decision) = handler.decide(error).await {
            return Ok(decision);
        }
    }
    Ok(NodeDecision::Fail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
    use crate::graph::{ExecutionStrategyRef, NodeKind};
    use crate::persistence::NullStateManager;
    use crate::retry_delay::Fixed;
    use crate::testing::NoHandlersFactory;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn test_ctx() -> PipelineContext {
        PipelineContext::new(
            "test",
            CancellationToken::new(),
            crate::context::RetryOptions { max_node_restart_attempts: 3 },
            Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default(), Duration::from_secs(600))),
            Arc::new(Fixed { delay: Duration::from_millis(1) }),
            Arc::new(NoHandlersFactory),
            Arc::new(NullStateManager),
            None,
        )
    }

    struct AlwaysSkip;

    #[async_trait]
    impl NodeHandlerDecider for AlwaysSkip {
        async fn decide(&self, _error: &RunError) -> Option<NodeDecision> {
            Some(NodeDecision::Skip)
        }
    }

    #[tokio::test]
    async fn skipped_item_is_dead_lettered_exactly_once() {
        let node = NodeDefinition::new("transform", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        let ctx = test_ctx();
        let sink = Arc::new(BoundedDeadLetterSink::new(10));
        ctx.set_dead_letter_sink(node.id.clone(), sink.clone());
        let handler = AlwaysSkip;

        let outcome = execute_with_retries(
            &node,
            &ctx,
            None,
            Some(&handler),
            || "3".to_owned(),
            |_attempt| async {
                Err::<i32, _>(RunError::Internal {
                    message: "boom".to_owned(),
                })
            },
        )
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Skipped));
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, "3");
    }

    #[tokio::test]
    async fn failure_without_any_handler_defaults_to_fail() {
        let node = NodeDefinition::new("transform", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        let ctx = test_ctx();

        let result = execute_with_retries(
            &node,
            &ctx,
            None,
            None,
            || "item".to_owned(),
            |_attempt| async {
                Err::<i32, _>(RunError::Internal {
                    message: "boom".to_owned(),
                })
            },
        )
        .await;

        assert!(matches!(result, Err(RunError::NodeExecution { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn cancelled_run_yields_cancelled_outcome_not_an_error() {
        let node = NodeDefinition::new("transform", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        let ctx = test_ctx();
        ctx.cancel().cancel();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let outcome = execute_with_retries(&node, &ctx, None, None, || "item".to_owned(), |_attempt| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Ok::<i32, RunError>(1) }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0, "body must not run once cancelled");
    }

    #[tokio::test]
    async fn cancellation_racing_a_failure_yields_cancelled_not_an_internal_error() {
        let node = NodeDefinition::new("transform", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        let ctx = test_ctx();

        let outcome = execute_with_retries(&node, &ctx, None, None, || "item".to_owned(), |_attempt| {
            ctx.cancel().cancel();
            async { Err::<i32, _>(RunError::Internal { message: "boom".to_owned() }) }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn retries_until_attempt_succeeds() {
        let node = NodeDefinition::new("transform", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        let ctx = test_ctx();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let outcome = execute_with_retries(&node, &ctx, None, None, || "item".to_owned(), |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if attempt < 2 {
                    Err(RunError::Internal { message: "boom".to_owned() })
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, Outcome::Success(42)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
