// SPDX-License-Identifier: Apache-2.0

//! The pipeline runner: walks the graph in topological
//! order, wiring each node's plan to its upstream pipes (merging non-Join
//! fan-in, multicasting fan-out) and collecting sink completion tasks.
//! Sink tasks are driven to completion via
//! `futures::stream::FuturesUnordered` rather than awaited one at a time,
//! since a pipeline's sinks finish in whatever order their upstream
//! producers drain, not necessarily graph order.

use crate::branch::multicast;
use crate::context::PipelineContext;
use crate::error::RunError;
use crate::graph::{topological_order, NodeId, NodeKind, PipelineGraph};
use crate::item::PItem;
use crate::observability::{NodeMetrics, NodeObservabilityScope, PipelineMetrics, PipelineMetricsSink};
use crate::pipe::{BoxedPipe, CountingPipe, Pipe};
use crate::pipe_merge::{CustomMergeFactory, PipeMergeService};
use crate::plan::{validate_edge_types, ExecutionPlan, NodeFactory, PlanOutput};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

enum TapDirection {
    In,
    Out,
}

/// Wraps an erased pipe, recording each item it yields against a node's
/// [`NodeObservabilityScope`].
struct ScopeTap {
    inner: BoxedPipe<PItem>,
    scope: Arc<NodeObservabilityScope>,
    direction: TapDirection,
}

impl ScopeTap {
    fn new(inner: BoxedPipe<PItem>, scope: Arc<NodeObservabilityScope>, direction: TapDirection) -> Self {
        ScopeTap { inner, scope, direction }
    }
}

#[async_trait::async_trait]
impl Pipe<PItem> for ScopeTap {
    async fn next(&mut self) -> Option<PItem> {
        let item = self.inner.next().await;
        if item.is_some() {
            match self.direction {
                TapDirection::In => self.scope.record_item_in(),
                TapDirection::Out => self.scope.record_item_out(),
            }
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

/// Runs a [`PipelineGraph`] to completion: builds each node's
/// [`ExecutionPlan`] via a [`NodeFactory`], validates inter-node type
/// compatibility once up front, then walks the graph in
/// topological order wiring pipes between nodes.
pub struct Runner {
    graph: PipelineGraph,
    node_factory: Arc<dyn NodeFactory>,
    default_branch_capacity: usize,
    default_merge_capacity: usize,
    metrics_sink: Option<Arc<dyn PipelineMetricsSink>>,
    custom_merge_factory: Option<Arc<dyn CustomMergeFactory>>,
}

impl Runner {
    /// Builds a runner for `graph`, resolving node plans through
    /// `node_factory`. Branch/merge capacities default to the graph's
    /// `ExecutionOptions`, falling back to 64 if unset.
    #[must_use]
    pub fn new(graph: PipelineGraph, node_factory: Arc<dyn NodeFactory>) -> Self {
        let default_branch_capacity = graph.execution_options.default_branch_capacity.unwrap_or(64);
        let default_merge_capacity = graph.execution_options.default_merge_capacity.unwrap_or(64);
        Runner {
            graph,
            node_factory,
            default_branch_capacity,
            default_merge_capacity,
            metrics_sink: None,
            custom_merge_factory: None,
        }
    }

    /// Registers a sink to receive [`PipelineMetrics`] when the run finishes.
    #[must_use]
    pub fn with_metrics_sink(mut self, sink: Arc<dyn PipelineMetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Registers the factory used to resolve nodes declaring
    /// `MergeStrategyKind::Custom`. Without one, any such node fails at
    /// run time with a configuration error.
    #[must_use]
    pub fn with_custom_merge_factory(mut self, factory: Arc<dyn CustomMergeFactory>) -> Self {
        self.custom_merge_factory = Some(factory);
        self
    }

    /// Runs the pipeline to completion under `ctx`. Returns the run's
    /// metrics on success, or the first node failure recorded during the
    /// run.
    pub async fn run(self, ctx: Arc<PipelineContext>) -> Result<PipelineMetrics, RunError> {
        let order = topological_order(&self.graph)?;
        let cancel = ctx.cancel().clone();

        let mut plans: HashMap<NodeId, Arc<dyn ExecutionPlan>> = HashMap::with_capacity(self.graph.nodes.len());
        for node in &self.graph.nodes {
            plans.insert(node.id.clone(), self.node_factory.create(node, &self.graph)?);
        }
        validate_edge_types(&self.graph, &plans)?;

        let mut edges_by_target: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut edges_by_source: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (index, edge) in self.graph.edges.iter().enumerate() {
            edges_by_target.entry(edge.target.clone()).or_default().push(index);
            edges_by_source.entry(edge.source.clone()).or_default().push(index);
        }

        let merge_service = PipeMergeService::new(self.default_merge_capacity);
        let mut edge_pipes: HashMap<usize, BoxedPipe<PItem>> = HashMap::new();
        let mut sink_handles: Vec<(NodeId, Instant, tokio::task::JoinHandle<Result<(), RunError>>)> = Vec::new();

        for node_id in &order {
            let node_def = self.graph.node(node_id).ok_or_else(|| RunError::Internal {
                message: format!("node `{node_id}` present in topological order but missing from graph"),
            })?;
            let node_def = Arc::new(node_def.clone());
            let plan = plans.get(node_id).cloned().ok_or_else(|| RunError::Config {
                message: format!("no execution plan registered for node `{node_id}`"),
            })?;

            let scope = Arc::new(NodeObservabilityScope::open(node_id.clone()));
            ctx.set_observability_scope(node_id.clone(), scope.clone());

            if let Some(type_name) = node_def.dead_letter_sink_type.as_deref() {
                if let Some(sink) = ctx.error_handler_factory().create_dead_letter_sink(type_name) {
                    ctx.set_dead_letter_sink(node_id.clone(), sink);
                }
            }

            let inbound_indices = edges_by_target.get(node_id).cloned().unwrap_or_default();
            let mut inputs: Vec<BoxedPipe<PItem>> = Vec::with_capacity(inbound_indices.len());
            for index in &inbound_indices {
                let pipe = edge_pipes.remove(index).ok_or_else(|| RunError::Internal {
                    message: format!("missing upstream pipe for edge #{index} feeding node `{node_id}`"),
                })?;
                inputs.push(Box::new(ScopeTap::new(pipe, scope.clone(), TapDirection::In)));
            }

            let invoke_inputs = if node_def.kind == NodeKind::Join || inputs.is_empty() {
                inputs
            } else {
                let custom = match &node_def.merge_strategy {
                    crate::graph::MergeStrategyKind::Custom(name) => self
                        .custom_merge_factory
                        .as_ref()
                        .and_then(|factory| factory.create_custom_merge(name)),
                    _ => None,
                };
                let merge_capacity = ctx.merge_capacity_for(node_id);
                let merged = merge_service
                    .merge(node_def.as_ref(), inputs, custom.as_deref(), merge_capacity, cancel.clone())
                    .await?;
                vec![merged]
            };

            let node_started_at = Instant::now();
            if let Some(observer) = ctx.observer() {
                observer.node_started(node_id, node_started_at);
            }

            let invoked = plan.invoke(node_def.clone(), invoke_inputs, ctx.clone(), cancel.clone()).await;
            let output = match invoked {
                Ok(output) => {
                    if let Some(observer) = ctx.observer() {
                        observer.node_completed(node_id, node_started_at.elapsed(), true, None);
                    }
                    crate::persistence::snapshot_after_success(ctx.state_manager().as_ref(), node_id, &ctx, &cancel).await;
                    output
                }
                Err(error) => {
                    scope.record_failure();
                    if let Some(observer) = ctx.observer() {
                        observer.node_completed(node_id, node_started_at.elapsed(), false, Some(&error));
                    }
                    return Err(error);
                }
            };

            match output {
                PlanOutput::Produced(pipe) => {
                    let pipe: BoxedPipe<PItem> = Box::new(ScopeTap::new(pipe, scope.clone(), TapDirection::Out));
                    let pipe: BoxedPipe<PItem> = Box::new(CountingPipe::new(pipe, ctx.total_processed_items().clone()));
                    let outbound_indices = edges_by_source.get(node_id).cloned().unwrap_or_default();
                    if outbound_indices.is_empty() {
                        let sink_node_id = node_id.clone();
                        sink_handles.push((
                            sink_node_id,
                            Instant::now(),
                            tokio::spawn(async move {
                                crate::pipe::drain_to_vec(pipe).await;
                                Ok(())
                            }),
                        ));
                    } else {
                        let branch_capacity = node_def
                            .branch_options
                            .and_then(|options| options.per_subscriber_buffer_capacity)
                            .unwrap_or(self.default_branch_capacity);
                        let branches = multicast(
                            node_id.clone(),
                            pipe,
                            outbound_indices.len(),
                            branch_capacity,
                            ctx.branch_metrics().clone(),
                            cancel.clone(),
                        );
                        for (edge_index, branch) in outbound_indices.into_iter().zip(branches) {
                            edge_pipes.insert(edge_index, branch);
                        }
                    }
                }
                PlanOutput::Sink(handle) => sink_handles.push((node_id.clone(), node_started_at, handle)),
            }
        }

        let mut in_flight = FuturesUnordered::new();
        for (sink_node_id, started_at, handle) in sink_handles {
            in_flight.push(async move {
                let result = handle.await;
                (sink_node_id, started_at, result)
            });
        }
        while let Some((sink_node_id, started_at, result)) = in_flight.next().await {
            match result {
                Ok(Ok(())) => {
                    if let Some(observer) = ctx.observer() {
                        observer.node_completed(&sink_node_id, started_at.elapsed(), true, None);
                    }
                    crate::persistence::snapshot_after_success(ctx.state_manager().as_ref(), &sink_node_id, &ctx, &cancel).await;
                }
                Ok(Err(error)) => {
                    if let Some(scope) = ctx.observability_scope(&sink_node_id) {
                        scope.record_failure();
                    }
                    if let Some(observer) = ctx.observer() {
                        observer.node_completed(&sink_node_id, started_at.elapsed(), false, Some(&error));
                    }
                    ctx.record_node_failure(error);
                }
                Err(join_error) => ctx.record_node_failure(RunError::Internal {
                    message: format!("sink task did not complete cleanly: {join_error}"),
                }),
            }
        }

        let failure = ctx.take_node_failure();
        let success = failure.is_none();
        let per_node: Vec<NodeMetrics> = self
            .graph
            .nodes
            .iter()
            .filter_map(|node| ctx.observability_scope(&node.id))
            .map(|scope| scope.metrics())
            .collect();

        let metrics = PipelineMetrics {
            name: ctx.pipeline_name().to_owned(),
            run_id: ctx.run_id(),
            start: ctx.start_time(),
            duration: ctx.start_time().elapsed(),
            success,
            total_items_processed: ctx.total_processed_items().get(),
            per_node,
        };

        if let Some(sink) = &self.metrics_sink {
            sink.emit(&metrics);
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(metrics),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
    use crate::context::RetryOptions;
    use crate::graph::{Edge, ExecutionStrategyRef, MergeStrategyKind, NodeDefinition, NodeKind};
    use crate::merge::{Concatenate, MergeStrategy};
    use crate::observability::NullExecutionObserver;
    use crate::persistence::NullStateManager;
    use crate::pipe_merge::CustomMergeStrategy;
    use crate::plan::StaticNodeFactoryBuilder;
    use crate::retry_delay::Fixed;
    use crate::strategy::StrategyConfig;
    use crate::testing::{CollectingSink, MapTransform, NoHandlersFactory, VecSource};
    use std::time::Duration;

    fn test_ctx() -> Arc<PipelineContext> {
        Arc::new(PipelineContext::new(
            "runner-test",
            CancellationToken::new(),
            RetryOptions::default(),
            Arc::new(CircuitBreakerManager::new(CircuitBreakerConfig::default(), Duration::from_secs(600))),
            Arc::new(Fixed { delay: Duration::from_millis(1) }),
            Arc::new(NoHandlersFactory),
            Arc::new(NullStateManager),
            Some(Arc::new(NullExecutionObserver)),
        ))
    }

    #[tokio::test]
    async fn linear_source_transform_sink_runs_to_completion() {
        let graph = PipelineGraph {
            nodes: vec![
                NodeDefinition::new("src", NodeKind::Source, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("double", NodeKind::Transform, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("sink", NodeKind::Sink, ExecutionStrategyRef::Sequential),
            ],
            edges: vec![Edge::new("src", "double"), Edge::new("double", "sink")],
            execution_options: Default::default(),
        };

        let sink = Arc::new(CollectingSink::<i32>::new());
        let factory = StaticNodeFactoryBuilder::new()
            .source("src", VecSource::new(vec![1, 2, 3, 4]))
            .transform("double", MapTransform::new(|x: i32| Ok(x * 2)), StrategyConfig::sequential(8))
            .sink("sink", CollectingSinkHandle(sink.clone()))
            .build();

        let metrics = Runner::new(graph, Arc::new(factory)).run(test_ctx()).await.unwrap();
        assert!(metrics.success);
        assert_eq!(sink.items(), vec![2, 4, 6, 8]);
        assert_eq!(metrics.total_items_processed, 8);
    }

    #[tokio::test]
    async fn fan_out_to_two_sinks_each_see_the_full_sequence() {
        let graph = PipelineGraph {
            nodes: vec![
                NodeDefinition::new("src", NodeKind::Source, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("sink_a", NodeKind::Sink, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("sink_b", NodeKind::Sink, ExecutionStrategyRef::Sequential),
            ],
            edges: vec![Edge::new("src", "sink_a"), Edge::new("src", "sink_b")],
            execution_options: Default::default(),
        };

        let sink_a = Arc::new(CollectingSink::<i32>::new());
        let sink_b = Arc::new(CollectingSink::<i32>::new());
        let factory = StaticNodeFactoryBuilder::new()
            .source("src", VecSource::new(vec![1, 2, 3]))
            .sink("sink_a", CollectingSinkHandle(sink_a.clone()))
            .sink("sink_b", CollectingSinkHandle(sink_b.clone()))
            .build();

        let metrics = Runner::new(graph, Arc::new(factory)).run(test_ctx()).await.unwrap();
        assert!(metrics.success);
        assert_eq!(sink_a.items(), vec![1, 2, 3]);
        assert_eq!(sink_b.items(), vec![1, 2, 3]);
    }

    struct ReverseConcat;

    #[async_trait::async_trait]
    impl MergeStrategy<PItem> for ReverseConcat {
        async fn merge(&self, merged_name: &str, mut inputs: Vec<BoxedPipe<PItem>>, cancel: CancellationToken) -> BoxedPipe<PItem> {
            inputs.reverse();
            Concatenate.merge(merged_name, inputs, cancel).await
        }
    }

    struct StaticCustomMergeFactory(Arc<CustomMergeStrategy>);

    impl crate::pipe_merge::CustomMergeFactory for StaticCustomMergeFactory {
        fn create_custom_merge(&self, name: &str) -> Option<Arc<CustomMergeStrategy>> {
            if name == "reverse" {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn registered_custom_merge_strategy_is_reachable_for_a_node() {
        let mut merge_node = NodeDefinition::new("merge", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        merge_node.merge_strategy = MergeStrategyKind::Custom("reverse".to_owned());

        let graph = PipelineGraph {
            nodes: vec![
                NodeDefinition::new("src_a", NodeKind::Source, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("src_b", NodeKind::Source, ExecutionStrategyRef::Sequential),
                merge_node,
                NodeDefinition::new("sink", NodeKind::Sink, ExecutionStrategyRef::Sequential),
            ],
            edges: vec![Edge::new("src_a", "merge"), Edge::new("src_b", "merge"), Edge::new("merge", "sink")],
            execution_options: Default::default(),
        };

        let sink = Arc::new(CollectingSink::<i32>::new());
        let factory = StaticNodeFactoryBuilder::new()
            .source("src_a", VecSource::new(vec![10]))
            .source("src_b", VecSource::new(vec![20]))
            .transform("merge", MapTransform::new(|x: i32| Ok(x)), StrategyConfig::sequential(8))
            .sink("sink", CollectingSinkHandle(sink.clone()))
            .build();

        let custom_merge_factory: Arc<dyn crate::pipe_merge::CustomMergeFactory> =
            Arc::new(StaticCustomMergeFactory(Arc::new(ReverseConcat)));

        let metrics = Runner::new(graph, Arc::new(factory))
            .with_custom_merge_factory(custom_merge_factory)
            .run(test_ctx())
            .await
            .unwrap();
        assert!(metrics.success);
        assert_eq!(sink.items(), vec![20, 10]);
    }

    #[tokio::test]
    async fn custom_merge_without_a_registered_factory_is_a_config_error() {
        let mut merge_node = NodeDefinition::new("merge", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        merge_node.merge_strategy = MergeStrategyKind::Custom("reverse".to_owned());

        let graph = PipelineGraph {
            nodes: vec![
                NodeDefinition::new("src_a", NodeKind::Source, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("src_b", NodeKind::Source, ExecutionStrategyRef::Sequential),
                merge_node,
                NodeDefinition::new("sink", NodeKind::Sink, ExecutionStrategyRef::Sequential),
            ],
            edges: vec![Edge::new("src_a", "merge"), Edge::new("src_b", "merge"), Edge::new("merge", "sink")],
            execution_options: Default::default(),
        };

        let sink = Arc::new(CollectingSink::<i32>::new());
        let factory = StaticNodeFactoryBuilder::new()
            .source("src_a", VecSource::new(vec![10]))
            .source("src_b", VecSource::new(vec![20]))
            .transform("merge", MapTransform::new(|x: i32| Ok(x)), StrategyConfig::sequential(8))
            .sink("sink", CollectingSinkHandle(sink))
            .build();

        let result = Runner::new(graph, Arc::new(factory)).run(test_ctx()).await;
        assert!(matches!(result, Err(RunError::Config { .. })));
    }

    #[tokio::test]
    async fn type_mismatch_between_nodes_is_a_config_error() {
        let graph = PipelineGraph {
            nodes: vec![
                NodeDefinition::new("src", NodeKind::Source, ExecutionStrategyRef::Sequential),
                NodeDefinition::new("sink", NodeKind::Sink, ExecutionStrategyRef::Sequential),
            ],
            edges: vec![Edge::new("src", "sink")],
            execution_options: Default::default(),
        };

        let sink = Arc::new(CollectingSink::<String>::new());
        let factory = StaticNodeFactoryBuilder::new()
            .source("src", VecSource::new(vec![1_i32, 2, 3]))
            .sink("sink", CollectingSinkHandle(sink))
            .build();

        let result = Runner::new(graph, Arc::new(factory)).run(test_ctx()).await;
        assert!(matches!(result, Err(RunError::Config { .. })));
    }

    struct CollectingSinkHandle<T>(Arc<CollectingSink<T>>);

    #[async_trait::async_trait]
    impl<T: crate::node::Item> crate::node::Sink<T> for CollectingSinkHandle<T> {
        async fn consume(&self, input: BoxedPipe<T>, ctx: &PipelineContext, cancel: CancellationToken) -> Result<(), RunError> {
            self.0.consume(input, ctx, cancel).await
        }
    }
}
