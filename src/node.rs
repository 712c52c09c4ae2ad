// SPDX-License-Identifier: Apache-2.0

//! Node traits: the contracts the engine consumes from user-supplied
//! source/transform/join/aggregate/sink implementations. Each is an
//! object-safe `async_trait`, built once by a [`crate::plan::NodeFactory`]
//! and driven through [`crate::plan::ExecutionPlan`] for the lifetime of
//! a run.

use crate::context::PipelineContext;
use crate::error::RunError;
use crate::item::PItem;
use crate::pipe::BoxedPipe;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Bound shared by every item type flowing through the engine: cheaply
/// cloneable (multicast fan-out and per-item retry both need to hand the
/// same logical item to more than one place), `Debug` (dead-letter
/// rendering), `Send + Sync + 'static` (crosses task boundaries freely).
pub trait Item: Clone + std::fmt::Debug + Send + Sync + 'static {}
impl<T: Clone + std::fmt::Debug + Send + Sync + 'static> Item for T {}

/// A source node: produces items, has no inbound edges.
#[async_trait]
pub trait Source<Out: Item>: Send + Sync {
    /// Produces this node's output pipe for one run.
    async fn produce(&self, ctx: &PipelineContext, cancel: CancellationToken) -> BoxedPipe<Out>;
}

/// A transform node: one input stream in, one output stream out, applied
/// one item at a time. A whole-pipe `apply(inPipe, ctx, cancel)` contract
/// would be an alternative to this per-item `processItem`; this engine
/// implements only the per-item contract, since it is the one the
/// Sequential and Parallel execution strategies actually drive, and a
/// node wanting to own its own streaming loop can do so by implementing
/// [`Aggregate`] instead (whose `Pipe<Out>` variant already covers "apply
/// that streams").
#[async_trait]
pub trait Transform<In: Item, Out: Item>: Send + Sync {
    /// Processes one input item, producing one output item.
    async fn process_item(&self, item: In, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<Out, RunError>;
}

/// A join node: consumes several, possibly heterogeneously-typed, input
/// streams and produces one output stream. Inputs bypass the non-Join
/// type filter and are handed over erased.
#[async_trait]
pub trait Join<Out: Item>: Send + Sync {
    /// Merges `inputs` (one per inbound edge, in declaration order) into
    /// this node's output pipe.
    async fn join(&self, inputs: Vec<BoxedPipe<PItem>>, ctx: &PipelineContext, cancel: CancellationToken) -> BoxedPipe<Out>;
}

/// The result of an aggregate node's single invocation.
pub enum AggregateOutcome<Out> {
    /// No output item.
    None,
    /// Exactly one output item.
    One(Out),
    /// A stream of output items.
    Stream(BoxedPipe<Out>),
}

/// An aggregate node: consumes one input stream and produces zero, one, or
/// a stream of outputs.
#[async_trait]
pub trait Aggregate<In: Item, Out: Item>: Send + Sync {
    /// Consumes `input` to completion (or until cancellation) and produces
    /// this node's output.
    async fn aggregate(&self, input: BoxedPipe<In>, cancel: CancellationToken) -> AggregateOutcome<Out>;
}

/// A sink node: consumes items, has no outbound edges.
#[async_trait]
pub trait Sink<In: Item>: Send + Sync {
    /// Consumes `input` to completion (or until cancellation).
    async fn consume(&self, input: BoxedPipe<In>, ctx: &PipelineContext, cancel: CancellationToken) -> Result<(), RunError>;
}
