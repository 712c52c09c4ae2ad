// SPDX-License-Identifier: Apache-2.0

//! Per-node execution strategies: Sequential, Parallel, and the Resilient
//! circuit-breaker gate. Every per-item call, regardless of scheduling,
//! goes through the universal [`crate::error_handling::execute_with_retries`]
//! wrapper.
//!
//! `Resilient` is modeled as an orthogonal circuit-breaker gate
//! ([`StrategyConfig::resilient`]) layered on top of either scheduling
//! choice, rather than a third scheduling mode of its own — a node's
//! concurrency and its resilience policy are independent knobs, and a
//! parallel node can still want per-call circuit breaking.

use crate::context::PipelineContext;
use crate::error::RunError;
use crate::error_handling::{execute_with_retries, NodeHandlerDecider, Outcome, PipelineErrorHandler};
use crate::graph::NodeDefinition;
use crate::node::{Item, Transform};
use crate::pipe::{BoxedPipe, Pipe, StreamingPipe};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// How a node's per-item calls are scheduled.
#[derive(Clone, Copy, Debug)]
pub enum Scheduling {
    /// One item at a time, in input order.
    Sequential,
    /// Up to `max_degree_of_parallelism` items in flight at once.
    Parallel {
        /// Bound on concurrent in-flight item calls.
        max_degree_of_parallelism: usize,
        /// `true` emits in input order (preserve mode); `false` emits as
        /// soon as each item completes (unordered mode).
        preserve_order: bool,
    },
}

/// Configuration for a node's execution strategy.
pub struct StrategyConfig {
    /// Scheduling discipline.
    pub scheduling: Scheduling,
    /// Whether this node is wrapped in the Resilient gate: consult the
    /// node's circuit breaker before every call, recording the outcome.
    pub resilient: bool,
    /// Bounded capacity of the output channel.
    pub output_capacity: usize,
}

impl StrategyConfig {
    /// A plain sequential strategy with no circuit breaker.
    #[must_use]
    pub fn sequential(output_capacity: usize) -> Self {
        StrategyConfig {
            scheduling: Scheduling::Sequential,
            resilient: false,
            output_capacity,
        }
    }

    /// A plain parallel strategy with no circuit breaker.
    #[must_use]
    pub fn parallel(max_degree_of_parallelism: usize, preserve_order: bool, output_capacity: usize) -> Self {
        StrategyConfig {
            scheduling: Scheduling::Parallel {
                max_degree_of_parallelism,
                preserve_order,
            },
            resilient: false,
            output_capacity,
        }
    }

    /// Wraps `self` in the Resilient circuit-breaker gate.
    #[must_use]
    pub fn resilient(mut self) -> Self {
        self.resilient = true;
        self
    }
}

/// Runs `transform` over `input` under `config`'s scheduling and
/// resilience policy, returning the output pipe. Spawns one driver task
/// (Sequential) or a dispatcher plus up to `max_degree_of_parallelism`
/// concurrent item tasks (Parallel); the returned pipe is fed as results
/// become available. On a terminal per-item failure the node's failure is
/// recorded on `ctx` and the output pipe ends early.
#[allow(clippy::too_many_arguments)]
pub fn run<In, Out, T>(
    config: StrategyConfig,
    mut input: BoxedPipe<In>,
    node: Arc<NodeDefinition>,
    transform: Arc<T>,
    ctx: Arc<PipelineContext>,
    pipeline_handler: Option<Arc<dyn PipelineErrorHandler>>,
    node_handler: Option<Arc<dyn NodeHandlerDecider>>,
    cancel: CancellationToken,
) -> BoxedPipe<Out>
where
    In: Item,
    Out: Item,
    T: Transform<In, Out> + 'static,
{
    let name = format!("{}-out", node.id);
    let (tx, pipe) = StreamingPipe::channel(name, config.output_capacity.max(1));

    match config.scheduling {
        Scheduling::Sequential => {
            tokio::spawn(async move {
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = input.next() => item,
                    };
                    let Some(item) = item else { break };
                    match run_item(
                        &node,
                        &ctx,
                        pipeline_handler.as_deref(),
                        node_handler.as_deref(),
                        config.resilient,
                        transform.as_ref(),
                        item,
                        &cancel,
                    )
                    .await
                    {
                        Ok(ItemOutcome::Produced(out)) => {
                            if tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Ok(ItemOutcome::Skipped) => {}
                        Ok(ItemOutcome::Cancelled) => break,
                        Err(error) => {
                            record_scope_failure(&ctx, &node.id);
                            ctx.record_node_failure(error);
                            break;
                        }
                    }
                }
                input.dispose();
            });
        }
        Scheduling::Parallel {
            max_degree_of_parallelism,
            preserve_order,
        } => {
            let semaphore = Arc::new(Semaphore::new(max_degree_of_parallelism.max(1)));
            let (result_tx, mut result_rx) = tokio::sync::mpsc::channel::<(u64, Result<ItemOutcome<Out>, RunError>)>(
                max_degree_of_parallelism.max(1) * 2,
            );
            let node_id_for_results = node.id.clone();

            let dispatch_cancel = cancel.clone();
            let dispatch_ctx = ctx.clone();
            tokio::spawn(async move {
                let mut seq: u64 = 0;
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = dispatch_cancel.cancelled() => break,
                        item = input.next() => item,
                    };
                    let Some(item) = item else { break };
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let this_seq = seq;
                    seq += 1;
                    let node = node.clone();
                    let ctx = dispatch_ctx.clone();
                    let transform = transform.clone();
                    let pipeline_handler = pipeline_handler.clone();
                    let node_handler = node_handler.clone();
                    let result_tx = result_tx.clone();
                    let resilient = config.resilient;
                    let item_cancel = dispatch_cancel.clone();
                    tokio::spawn(async move {
                        let result = run_item(
                            &node,
                            &ctx,
                            pipeline_handler.as_deref(),
                            node_handler.as_deref(),
                            resilient,
                            transform.as_ref(),
                            item,
                            &item_cancel,
                        )
                        .await;
                        drop(permit);
                        let _ = result_tx.send((this_seq, result)).await;
                    });
                }
                input.dispose();
            });
            drop(result_tx);

            if preserve_order {
                tokio::spawn(async move {
                    let mut pending: BTreeMap<u64, Result<ItemOutcome<Out>, RunError>> = BTreeMap::new();
                    let mut next_seq: u64 = 0;
                    while let Some((seq, result)) = result_rx.recv().await {
                        pending.insert(seq, result);
                        while let Some(result) = pending.remove(&next_seq) {
                            next_seq += 1;
                            match result {
                                Ok(ItemOutcome::Produced(out)) => {
                                    if tx.send(out).await.is_err() {
                                        return;
                                    }
                                }
                                Ok(ItemOutcome::Skipped) => {}
                                Ok(ItemOutcome::Cancelled) => return,
                                Err(error) => {
                                    record_scope_failure(&ctx, &node_id_for_results);
                                    ctx.record_node_failure(error);
                                    return;
                                }
                            }
                        }
                    }
                });
            } else {
                tokio::spawn(async move {
                    while let Some((_, result)) = result_rx.recv().await {
                        match result {
                            Ok(ItemOutcome::Produced(out)) => {
                                if tx.send(out).await.is_err() {
                                    return;
                                }
                            }
                            Ok(ItemOutcome::Skipped) => {}
                            Ok(ItemOutcome::Cancelled) => return,
                            Err(error) => {
                                record_scope_failure(&ctx, &node_id_for_results);
                                ctx.record_node_failure(error);
                                return;
                            }
                        }
                    }
                });
            }
        }
    }

    Box::new(pipe)
}

/// Records a node-internal failure against `node`'s auto-observability
/// scope, if one has been opened for it yet. A
/// no-op for runs that never registered a scope (e.g. a strategy exercised
/// directly in a unit test without going through [`crate::runner::Runner`]).
fn record_scope_failure(ctx: &PipelineContext, node: &crate::graph::NodeId) {
    if let Some(scope) = ctx.observability_scope(node) {
        scope.record_failure();
    }
}

/// Result of running a single item through [`run_item`].
enum ItemOutcome<Out> {
    /// The transform produced `Out`.
    Produced(Out),
    /// The item was skipped by error handling; nothing to emit.
    Skipped,
    /// The run was cancelled; the caller should stop cleanly without
    /// recording a node failure.
    Cancelled,
}

/// Runs one item through the universal error-handling wrapper,
/// optionally gating the call on the node's circuit breaker first (the
/// Resilient addition).
#[allow(clippy::too_many_arguments)]
async fn run_item<In, Out, T>(
    node: &NodeDefinition,
    ctx: &PipelineContext,
    pipeline_handler: Option<&dyn PipelineErrorHandler>,
    node_handler: Option<&dyn NodeHandlerDecider>,
    resilient: bool,
    transform: &T,
    item: In,
    cancel: &CancellationToken,
) -> Result<ItemOutcome<Out>, RunError>
where
    In: Item,
    Out: Item,
    T: Transform<In, Out>,
{
    let dead_letter_item = item.clone();
    let outcome = execute_with_retries(
        node,
        ctx,
        pipeline_handler,
        node_handler,
        move || format!("{dead_letter_item:?}"),
        |_attempt| {
            let item = item.clone();
            let cancel = cancel.clone();
            async move {
                if resilient {
                    let guard = match ctx.circuit_breakers().acquire(&node.id) {
                        Some(guard) => guard,
                        None => {
                            return Err(RunError::CircuitBreakerTripped { node: node.id.clone() });
                        }
                    };
                    match transform.process_item(item, ctx, &cancel).await {
                        Ok(out) => {
                            guard.record_success();
                            Ok(out)
                        }
                        Err(error) => {
                            guard.record_failure();
                            Err(error)
                        }
                    }
                } else {
                    transform.process_item(item, ctx, &cancel).await
                }
            }
        },
    )
    .await?;

    Ok(match outcome {
        Outcome::Success(value) => ItemOutcome::Produced(value),
        Outcome::Skipped => ItemOutcome::Skipped,
        Outcome::Cancelled => ItemOutcome::Cancelled,
    })
}
