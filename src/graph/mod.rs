// SPDX-License-Identifier: Apache-2.0

//! Pipeline graph model: node and edge definitions, the pipeline-wide
//! execution options, and the topological scheduler. Nodes are keyed by
//! id with edges forming a DAG between them, deserializable straight from
//! JSON or YAML for the common case of a pipeline described in config
//! rather than assembled in code.

mod topology;

pub use topology::topological_order;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A node identifier, unique within a single [`PipelineGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Arc<str>);

impl NodeId {
    /// Builds a new node id from any string-like value.
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        NodeId(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId::new(value)
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId::new(value)
    }
}

/// The role a node plays in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces items; no inbound edges.
    Source,
    /// Consumes one input stream, produces one output stream.
    Transform,
    /// Consumes multiple, possibly heterogeneously-typed, input streams.
    Join,
    /// Consumes one input stream, produces zero, one, or a stream of outputs.
    Aggregate,
    /// Consumes items; no outbound edges.
    Sink,
}

/// Which fan-in strategy a node should use to combine its upstream pipes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategyKind {
    /// Fair, order-preserving-per-input interleave (the default).
    Interleave,
    /// Fully drain input *i* before touching input *i+1*.
    Concatenate,
    /// A node-supplied custom merge strategy, registered under the given
    /// name and resolved at run time.
    Custom(String),
}

impl Default for MergeStrategyKind {
    fn default() -> Self {
        MergeStrategyKind::Interleave
    }
}

/// Reference to the execution strategy a node runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategyRef {
    /// One item at a time, in input order.
    Sequential,
    /// Bounded concurrency, ordered or unordered completion.
    Parallel,
    /// Wraps another strategy with retry and circuit-breaker logic.
    Resilient,
}

/// Per-node branching (fan-out multicast) configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchOptions {
    /// Bounded capacity of each per-subscriber queue. `None` falls back to
    /// the graph-wide default.
    #[serde(default)]
    pub per_subscriber_buffer_capacity: Option<usize>,
}

/// Per-node parallel-strategy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelOptions {
    /// Maximum number of in-flight item tasks.
    pub max_degree_of_parallelism: usize,
    /// When `true`, output is emitted in input order (at the cost of head-
    /// of-line blocking on a slow item). When `false`, output is emitted
    /// as items complete.
    #[serde(default = "default_preserve_order")]
    pub preserve_order: bool,
}

fn default_preserve_order() -> bool {
    true
}

impl Default for ParallelOptions {
    fn default() -> Self {
        ParallelOptions {
            max_degree_of_parallelism: 4,
            preserve_order: true,
        }
    }
}

/// One node in a [`PipelineGraph`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique id within the graph.
    pub id: NodeId,
    /// The node's role (source/transform/join/aggregate/sink).
    pub kind: NodeKind,
    /// Execution strategy this node runs under.
    pub execution_strategy: ExecutionStrategyRef,
    /// Name of a registered node-level error handler type, if any.
    #[serde(default)]
    pub error_handler_type: Option<String>,
    /// Name of a registered dead-letter sink type, if any.
    #[serde(default)]
    pub dead_letter_sink_type: Option<String>,
    /// Fan-in merge strategy for this node's inbound edges.
    #[serde(default)]
    pub merge_strategy: MergeStrategyKind,
    /// Per-node branching (fan-out) options.
    #[serde(default)]
    pub branch_options: Option<BranchOptions>,
    /// Per-node parallel-strategy options, used when `execution_strategy`
    /// is [`ExecutionStrategyRef::Parallel`] (directly, or nested inside
    /// [`ExecutionStrategyRef::Resilient`]).
    #[serde(default)]
    pub parallel_options: Option<ParallelOptions>,
    /// Arbitrary node-specific configuration, opaque to the engine and
    /// forwarded to the node factory.
    #[serde(default)]
    pub annotations: serde_json::Map<String, serde_json::Value>,
}

impl NodeDefinition {
    /// Convenience constructor for a node with otherwise-default options.
    pub fn new(id: impl Into<NodeId>, kind: NodeKind, execution_strategy: ExecutionStrategyRef) -> Self {
        NodeDefinition {
            id: id.into(),
            kind,
            execution_strategy,
            error_handler_type: None,
            dead_letter_sink_type: None,
            merge_strategy: MergeStrategyKind::default(),
            branch_options: None,
            parallel_options: None,
            annotations: serde_json::Map::new(),
        }
    }
}

/// A directed edge between two nodes, identified by node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The upstream node.
    pub source: NodeId,
    /// The downstream node.
    pub target: NodeId,
}

impl Edge {
    /// Builds a new edge.
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Edge {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Graph-wide circuit breaker defaults, overridable per node via
/// [`PipelineContext`](crate::context::PipelineContext) keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerOptions {
    /// Number of consecutive (or windowed) failures before tripping open.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a half-open trial.
    #[serde(with = "duration_millis")]
    pub open_duration: std::time::Duration,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        CircuitBreakerOptions {
            failure_threshold: 5,
            open_duration: std::time::Duration::from_secs(30),
        }
    }
}

/// Graph-wide idle-eviction policy for the circuit breaker manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryOptions {
    /// Evict a node's circuit breaker after it has been idle this long.
    #[serde(with = "duration_millis")]
    pub idle_eviction_after: std::time::Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            idle_eviction_after: std::time::Duration::from_secs(600),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Pipeline-wide execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Default annotations applied to every node unless overridden.
    #[serde(default)]
    pub node_execution_annotations: serde_json::Map<String, serde_json::Value>,
    /// Graph-wide circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker_options: Option<CircuitBreakerOptions>,
    /// Graph-wide circuit breaker memory-management policy.
    #[serde(default)]
    pub memory_options: Option<MemoryOptions>,
    /// Graph-wide default per-subscriber branching buffer capacity.
    #[serde(default)]
    pub default_branch_capacity: Option<usize>,
    /// Graph-wide default merge-queue capacity.
    #[serde(default)]
    pub default_merge_capacity: Option<usize>,
}

/// A validated, directed acyclic graph of nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineGraph {
    /// All nodes in the graph.
    pub nodes: Vec<NodeDefinition>,
    /// All edges in the graph.
    pub edges: Vec<Edge>,
    /// Pipeline-wide execution options.
    #[serde(default)]
    pub execution_options: ExecutionOptions,
}

impl PipelineGraph {
    /// Parses a pipeline graph from a JSON document and validates it.
    pub fn from_json(json: &str) -> Result<Self, crate::error::RunError> {
        let graph: PipelineGraph = serde_json::from_str(json).map_err(|e| crate::error::RunError::Config {
            message: format!("failed to parse pipeline graph JSON: {e}"),
        })?;
        graph.validate()?;
        Ok(graph)
    }

    /// Parses a pipeline graph from a YAML document and validates it.
    pub fn from_yaml(yaml: &str) -> Result<Self, crate::error::RunError> {
        let graph: PipelineGraph = serde_yaml::from_str(yaml).map_err(|e| crate::error::RunError::Config {
            message: format!("failed to parse pipeline graph YAML: {e}"),
        })?;
        graph.validate()?;
        Ok(graph)
    }

    /// Looks up a node definition by id.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Returns the inbound edges for a node, preserving edge declaration
    /// order (used by the pipe-merge service for `Concatenate`'s total
    /// order).
    #[must_use]
    pub fn inbound_edges<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.target == id)
    }

    /// Returns the outbound edges for a node.
    #[must_use]
    pub fn outbound_edges<'a>(&'a self, id: &'a NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.source == id)
    }

    /// Validates the structural invariants of the graph: unique ids,
    /// edges referencing existing nodes, acyclicity, sources with no
    /// inbound edges, sinks with no outbound edges.
    pub fn validate(&self) -> Result<(), crate::error::RunError> {
        let mut seen = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if seen.insert(&node.id, ()).is_some() {
                return Err(crate::error::RunError::Config {
                    message: format!("duplicate node id `{}`", node.id),
                });
            }
        }
        for edge in &self.edges {
            if !seen.contains_key(&edge.source) {
                return Err(crate::error::RunError::Config {
                    message: format!("edge references unknown source node `{}`", edge.source),
                });
            }
            if !seen.contains_key(&edge.target) {
                return Err(crate::error::RunError::Config {
                    message: format!("edge references unknown target node `{}`", edge.target),
                });
            }
        }
        for node in &self.nodes {
            match node.kind {
                NodeKind::Source => {
                    if self.inbound_edges(&node.id).next().is_some() {
                        return Err(crate::error::RunError::Config {
                            message: format!("source node `{}` has inbound edges", node.id),
                        });
                    }
                }
                NodeKind::Sink => {
                    if self.outbound_edges(&node.id).next().is_some() {
                        return Err(crate::error::RunError::Config {
                            message: format!("sink node `{}` has outbound edges", node.id),
                        });
                    }
                }
                _ => {}
            }
        }
        // Acyclicity is validated as a side effect of computing a
        // topological order.
        let _ = topological_order(self)?;
        Ok(())
    }
}
