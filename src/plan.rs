// SPDX-License-Identifier: Apache-2.0

//! Node instantiation & plan builder: binds graph node
//! definitions to invocable delegates.
//!
//! [`ExecutionPlan`] is the dispatch table this replaces reflection with:
//! one object-safe, `async_trait`-based trait object per node, keyed by
//! `(kind, input-type-id, output-type-id)`, built once by a
//! [`NodeFactory`] and stored in a `HashMap<NodeId, Arc<dyn
//! ExecutionPlan>>` — no runtime type registry required.

use crate::context::PipelineContext;
use crate::error::RunError;
use crate::error_handling::{NodeErrorHandler, NodeHandlerDecider, PipelineErrorHandler};
use crate::graph::{NodeDefinition, NodeKind, PipelineGraph};
use crate::item::{Erase, PItem, Unerase};
use crate::node::{Aggregate, AggregateOutcome, Item, Join, Sink, Source, Transform};
use crate::pipe::{BoxedPipe, InMemoryPipe};
use crate::strategy::{self, StrategyConfig};
use async_trait::async_trait;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// What one node invocation produces, handed back to the runner.
pub enum PlanOutput {
    /// A source/transform/join/aggregate node's output pipe, erased.
    Produced(BoxedPipe<PItem>),
    /// A sink node's background consumption task. The runner collects
    /// these and awaits them after the DAG finishes wiring.
    Sink(tokio::task::JoinHandle<Result<(), RunError>>),
}

/// An instantiated, invocable node, bound to its concrete item types at
/// construction time.
#[async_trait]
pub trait ExecutionPlan: Send + Sync {
    /// This node's role.
    fn kind(&self) -> NodeKind;

    /// The `TypeId`/name of the node's declared input type, used by
    /// [`validate_edge_types`]. `None` for Source nodes and for Join nodes
    /// (which bypass the non-Join type filter).
    fn input_type(&self) -> Option<(TypeId, &'static str)>;

    /// The `TypeId`/name of the node's declared output type. `None` for
    /// Sink nodes.
    fn output_type(&self) -> Option<(TypeId, &'static str)>;

    /// Invokes the node: gathers `inputs` (already merged into one pipe
    /// for non-Join nodes, or one pipe per inbound edge for Join nodes, in
    /// declaration order), runs it under its execution strategy, and
    /// returns its output.
    async fn invoke(
        &self,
        node: Arc<NodeDefinition>,
        inputs: Vec<BoxedPipe<PItem>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError>;
}

/// Resolves [`NodeDefinition`]s to [`ExecutionPlan`]s. Implementations typically look up or build a typed
/// adapter per node id; [`StaticNodeFactory`] is the built-in one, backed
/// by a pre-registered map.
pub trait NodeFactory: Send + Sync {
    /// Builds (or looks up) the execution plan for `def` within `graph`.
    fn create(&self, def: &NodeDefinition, graph: &PipelineGraph) -> Result<Arc<dyn ExecutionPlan>, RunError>;
}

/// Validates that, for every edge `(u, v)` where `v` is not a Join node,
/// `u`'s declared output type equals `v`'s declared input type
///. Raised once before the run
/// starts, never per item.
pub fn validate_edge_types(graph: &PipelineGraph, plans: &HashMap<crate::graph::NodeId, Arc<dyn ExecutionPlan>>) -> Result<(), RunError> {
    for edge in &graph.edges {
        let Some(target_def) = graph.node(&edge.target) else {
            continue;
        };
        if target_def.kind == NodeKind::Join {
            continue;
        }
        let source_plan = plans.get(&edge.source).ok_or_else(|| RunError::Config {
            message: format!("no execution plan registered for node `{}`", edge.source),
        })?;
        let target_plan = plans.get(&edge.target).ok_or_else(|| RunError::Config {
            message: format!("no execution plan registered for node `{}`", edge.target),
        })?;
        let (Some((source_type_id, source_type_name)), Some((target_type_id, target_type_name))) =
            (source_plan.output_type(), target_plan.input_type())
        else {
            continue;
        };
        if source_type_id != target_type_id {
            return Err(RunError::Config {
                message: format!(
                    "type mismatch on edge `{}` -> `{}`: output type `{source_type_name}` is not assignable to input type `{target_type_name}`",
                    edge.source, edge.target
                ),
            });
        }
    }
    Ok(())
}

/// Binds a resolved [`NodeErrorHandler<In>`] to the node and run it failed
/// within, so [`execute_with_retries`](crate::error_handling::execute_with_retries)
/// can consult it through the item-type-erased [`NodeHandlerDecider`] seam.
struct ResolvedNodeHandler<In> {
    handler: Arc<dyn NodeErrorHandler<In>>,
    node: Arc<NodeDefinition>,
    ctx: Arc<PipelineContext>,
}

#[async_trait]
impl<In: Item> NodeHandlerDecider for ResolvedNodeHandler<In> {
    async fn decide(&self, error: &RunError) -> Option<crate::error_handling::NodeDecision> {
        // The failing item itself is not threaded down to this layer (the
        // dead-letter sink already receives it independently); a handler
        // that needs the item to decide should register a dead-letter sink
        // instead, which does see it.
        Some(self.handler.handle(&self.node, None, error, &self.ctx).await)
    }
}

fn resolve_node_handler<In: Item>(node: &Arc<NodeDefinition>, ctx: &Arc<PipelineContext>) -> Option<Arc<dyn NodeHandlerDecider>> {
    let type_name = node.error_handler_type.as_deref()?;
    let erased = ctx.error_handler_factory().create_error_handler(type_name)?;
    let handler = erased.downcast::<Arc<dyn NodeErrorHandler<In>>>().ok()?.as_ref().clone();
    Some(Arc::new(ResolvedNodeHandler {
        handler,
        node: node.clone(),
        ctx: ctx.clone(),
    }))
}

/// A Source plan: produces `Out`, no inbound edges.
pub struct SourcePlan<Out, S> {
    source: Arc<S>,
    _marker: PhantomData<fn() -> Out>,
}

impl<Out: Item, S: Source<Out> + 'static> SourcePlan<Out, S> {
    /// Wraps a concrete [`Source`] implementation as a plan.
    pub fn new(source: Arc<S>) -> Self {
        SourcePlan {
            source,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Out: Item, S: Source<Out> + 'static> ExecutionPlan for SourcePlan<Out, S> {
    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    fn input_type(&self) -> Option<(TypeId, &'static str)> {
        None
    }

    fn output_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<Out>(), std::any::type_name::<Out>()))
    }

    async fn invoke(
        &self,
        _node: Arc<NodeDefinition>,
        _inputs: Vec<BoxedPipe<PItem>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError> {
        let output = self.source.produce(&ctx, cancel).await;
        Ok(PlanOutput::Produced(Box::new(Erase::new(output))))
    }
}

/// A Transform plan: runs `T` under a configured [`StrategyConfig`].
pub struct TransformPlan<In, Out, T> {
    transform: Arc<T>,
    config_template: StrategyConfig,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In: Item, Out: Item, T: Transform<In, Out> + 'static> TransformPlan<In, Out, T> {
    /// Wraps a concrete [`Transform`] under `config`.
    pub fn new(transform: Arc<T>, config: StrategyConfig) -> Self {
        TransformPlan {
            transform,
            config_template: config,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<In: Item, Out: Item, T: Transform<In, Out> + 'static> ExecutionPlan for TransformPlan<In, Out, T> {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    fn input_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<In>(), std::any::type_name::<In>()))
    }

    fn output_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<Out>(), std::any::type_name::<Out>()))
    }

    async fn invoke(
        &self,
        node: Arc<NodeDefinition>,
        inputs: Vec<BoxedPipe<PItem>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError> {
        let merged = inputs
            .into_iter()
            .next()
            .unwrap_or_else(|| Box::new(InMemoryPipe::new(format!("{}-in-empty", node.id), Vec::new())));
        let typed_in: BoxedPipe<In> = Box::new(Unerase::new(merged));
        let node_handler = resolve_node_handler::<In>(&node, &ctx);
        let pipeline_handler = ctx.pipeline_error_handler().cloned();
        let output = strategy::run(
            clone_config(&self.config_template),
            typed_in,
            node,
            self.transform.clone(),
            ctx,
            pipeline_handler,
            node_handler,
            cancel,
        );
        Ok(PlanOutput::Produced(Box::new(Erase::new(output))))
    }
}

fn clone_config(config: &StrategyConfig) -> StrategyConfig {
    StrategyConfig {
        scheduling: config.scheduling,
        resilient: config.resilient,
        output_capacity: config.output_capacity,
    }
}

/// A Join plan: consumes heterogeneous erased inputs directly.
pub struct JoinPlan<Out, J> {
    join: Arc<J>,
    _marker: PhantomData<fn() -> Out>,
}

impl<Out: Item, J: Join<Out> + 'static> JoinPlan<Out, J> {
    /// Wraps a concrete [`Join`] implementation as a plan.
    pub fn new(join: Arc<J>) -> Self {
        JoinPlan {
            join,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Out: Item, J: Join<Out> + 'static> ExecutionPlan for JoinPlan<Out, J> {
    fn kind(&self) -> NodeKind {
        NodeKind::Join
    }

    fn input_type(&self) -> Option<(TypeId, &'static str)> {
        None
    }

    fn output_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<Out>(), std::any::type_name::<Out>()))
    }

    async fn invoke(
        &self,
        _node: Arc<NodeDefinition>,
        inputs: Vec<BoxedPipe<PItem>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError> {
        let output = self.join.join(inputs, &ctx, cancel).await;
        Ok(PlanOutput::Produced(Box::new(Erase::new(output))))
    }
}

/// An Aggregate plan: produces zero, one, or a stream of outputs.
pub struct AggregatePlan<In, Out, A> {
    aggregate: Arc<A>,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In: Item, Out: Item, A: Aggregate<In, Out> + 'static> AggregatePlan<In, Out, A> {
    /// Wraps a concrete [`Aggregate`] implementation as a plan.
    pub fn new(aggregate: Arc<A>) -> Self {
        AggregatePlan {
            aggregate,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<In: Item, Out: Item, A: Aggregate<In, Out> + 'static> ExecutionPlan for AggregatePlan<In, Out, A> {
    fn kind(&self) -> NodeKind {
        NodeKind::Aggregate
    }

    fn input_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<In>(), std::any::type_name::<In>()))
    }

    fn output_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<Out>(), std::any::type_name::<Out>()))
    }

    async fn invoke(
        &self,
        node: Arc<NodeDefinition>,
        inputs: Vec<BoxedPipe<PItem>>,
        _ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError> {
        let merged = inputs
            .into_iter()
            .next()
            .unwrap_or_else(|| Box::new(InMemoryPipe::new(format!("{}-in-empty", node.id), Vec::new())));
        let typed_in: BoxedPipe<In> = Box::new(Unerase::new(merged));
        let outcome = self.aggregate.aggregate(typed_in, cancel).await;
        let erased: BoxedPipe<PItem> = match outcome {
            AggregateOutcome::None => Box::new(InMemoryPipe::new(format!("{}-out-empty", node.id), Vec::new())),
            AggregateOutcome::One(value) => Box::new(InMemoryPipe::new(format!("{}-out", node.id), vec![PItem::new(value)])),
            AggregateOutcome::Stream(pipe) => Box::new(Erase::new(pipe)),
        };
        Ok(PlanOutput::Produced(erased))
    }
}

/// A Sink plan: consumes `In`, returns no output.
pub struct SinkPlan<In, K> {
    sink: Arc<K>,
    _marker: PhantomData<fn(In)>,
}

impl<In: Item, K: Sink<In> + 'static> SinkPlan<In, K> {
    /// Wraps a concrete [`Sink`] implementation as a plan.
    pub fn new(sink: Arc<K>) -> Self {
        SinkPlan {
            sink,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<In: Item, K: Sink<In> + 'static> ExecutionPlan for SinkPlan<In, K> {
    fn kind(&self) -> NodeKind {
        NodeKind::Sink
    }

    fn input_type(&self) -> Option<(TypeId, &'static str)> {
        Some((TypeId::of::<In>(), std::any::type_name::<In>()))
    }

    fn output_type(&self) -> Option<(TypeId, &'static str)> {
        None
    }

    async fn invoke(
        &self,
        node: Arc<NodeDefinition>,
        inputs: Vec<BoxedPipe<PItem>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<PlanOutput, RunError> {
        let merged = inputs
            .into_iter()
            .next()
            .unwrap_or_else(|| Box::new(InMemoryPipe::new(format!("{}-in-empty", node.id), Vec::new())));
        let typed_in: BoxedPipe<In> = Box::new(Unerase::new(merged));
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move { sink.consume(typed_in, &ctx, cancel).await });
        Ok(PlanOutput::Sink(handle))
    }
}

/// A [`NodeFactory`] backed by a pre-registered `NodeId -> ExecutionPlan`
/// map, built with [`StaticNodeFactoryBuilder`]. The common case for
/// programmatically-assembled pipelines and for tests; a graph-driven
/// application typically pairs this with its own factory that looks up
/// node kinds by `annotations`.
pub struct StaticNodeFactory {
    plans: HashMap<crate::graph::NodeId, Arc<dyn ExecutionPlan>>,
}

impl NodeFactory for StaticNodeFactory {
    fn create(&self, def: &NodeDefinition, _graph: &PipelineGraph) -> Result<Arc<dyn ExecutionPlan>, RunError> {
        self.plans.get(&def.id).cloned().ok_or_else(|| RunError::Config {
            message: format!("no execution plan registered for node `{}`", def.id),
        })
    }
}

/// Builds a [`StaticNodeFactory`] by registering one typed plan per node.
#[derive(Default)]
pub struct StaticNodeFactoryBuilder {
    plans: HashMap<crate::graph::NodeId, Arc<dyn ExecutionPlan>>,
}

impl StaticNodeFactoryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        StaticNodeFactoryBuilder::default()
    }

    /// Registers a source node.
    #[must_use]
    pub fn source<Out: Item, S: Source<Out> + 'static>(mut self, id: impl Into<crate::graph::NodeId>, source: S) -> Self {
        self.plans.insert(id.into(), Arc::new(SourcePlan::new(Arc::new(source))));
        self
    }

    /// Registers a transform node under `config`.
    #[must_use]
    pub fn transform<In: Item, Out: Item, T: Transform<In, Out> + 'static>(
        mut self,
        id: impl Into<crate::graph::NodeId>,
        transform: T,
        config: StrategyConfig,
    ) -> Self {
        self.plans
            .insert(id.into(), Arc::new(TransformPlan::new(Arc::new(transform), config)));
        self
    }

    /// Registers a join node.
    #[must_use]
    pub fn join<Out: Item, J: Join<Out> + 'static>(mut self, id: impl Into<crate::graph::NodeId>, join: J) -> Self {
        self.plans.insert(id.into(), Arc::new(JoinPlan::new(Arc::new(join))));
        self
    }

    /// Registers an aggregate node.
    #[must_use]
    pub fn aggregate<In: Item, Out: Item, A: Aggregate<In, Out> + 'static>(
        mut self,
        id: impl Into<crate::graph::NodeId>,
        aggregate: A,
    ) -> Self {
        self.plans.insert(id.into(), Arc::new(AggregatePlan::new(Arc::new(aggregate))));
        self
    }

    /// Registers a sink node.
    #[must_use]
    pub fn sink<In: Item, K: Sink<In> + 'static>(mut self, id: impl Into<crate::graph::NodeId>, sink: K) -> Self {
        self.plans.insert(id.into(), Arc::new(SinkPlan::new(Arc::new(sink))));
        self
    }

    /// Finalizes the factory.
    #[must_use]
    pub fn build(self) -> StaticNodeFactory {
        StaticNodeFactory { plans: self.plans }
    }
}
