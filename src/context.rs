// SPDX-License-Identifier: Apache-2.0

//! Per-run pipeline context: the shared, mostly-append-only state threaded
//! through every node invocation. Built once per run — retry policy,
//! circuit breakers, error handlers, and the observability collaborators
//! all live here — and passed by reference to every strategy and node
//! call.

use crate::branch::BranchMetricsRegistry;
use crate::circuit_breaker::CircuitBreakerManager;
use crate::error_handling::{DeadLetterSink, ErrorHandlerFactory, PipelineErrorHandler};
use crate::graph::NodeId;
use crate::observability::{ExecutionObserver, NodeObservabilityScope};
use crate::persistence::StateManager;
use crate::pipe::StatsCounter;
use crate::retry_delay::RetryDelay;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Effective retry options for a node, resolved with precedence: per-node
/// override → global default.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Maximum number of restart attempts (including the first call).
    pub max_node_restart_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            max_node_restart_attempts: 1,
        }
    }
}

/// Arbitrary, serializable-adjacent items a node or strategy can stash in
/// the context. Intentionally permissive (`Box<dyn Any>`) since the core
/// never interprets these values itself; well-known keys are instead
/// exposed as first-class fields/methods on [`PipelineContext`] rather
/// than going through this map.
pub type ItemsMap = HashMap<String, Box<dyn std::any::Any + Send + Sync>>;

/// Per-run mutable state and injected collaborators, shared across every
/// node of a run.
pub struct PipelineContext {
    run_id: uuid::Uuid,
    pipeline_name: String,
    start_time: Instant,
    cancel: CancellationToken,
    total_processed_items: Arc<StatsCounter>,
    global_retry_options: RetryOptions,
    node_retry_options: RwLock<HashMap<NodeId, RetryOptions>>,
    node_merge_capacity: RwLock<HashMap<NodeId, usize>>,
    circuit_breakers: Arc<CircuitBreakerManager>,
    retry_delay: Arc<dyn RetryDelay>,
    error_handler_factory: Arc<dyn ErrorHandlerFactory>,
    pipeline_error_handler: Option<Arc<dyn PipelineErrorHandler>>,
    dead_letter_sinks: RwLock<HashMap<NodeId, Arc<dyn DeadLetterSink>>>,
    branch_metrics: BranchMetricsRegistry,
    observability_scopes: RwLock<HashMap<NodeId, Arc<NodeObservabilityScope>>>,
    observer: Option<Arc<dyn ExecutionObserver>>,
    state_manager: Arc<dyn StateManager>,
    parallel_execution: bool,
    items: RwLock<ItemsMap>,
    last_retry_exhausted: RwLock<Option<String>>,
    node_failure: Mutex<Option<crate::error::RunError>>,
}

impl PipelineContext {
    /// Builds a new context for a run, generating a fresh run id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pipeline_name: impl Into<String>,
        cancel: CancellationToken,
        global_retry_options: RetryOptions,
        circuit_breakers: Arc<CircuitBreakerManager>,
        retry_delay: Arc<dyn RetryDelay>,
        error_handler_factory: Arc<dyn ErrorHandlerFactory>,
        state_manager: Arc<dyn StateManager>,
        observer: Option<Arc<dyn ExecutionObserver>>,
    ) -> Self {
        PipelineContext {
            run_id: uuid::Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            start_time: Instant::now(),
            cancel,
            total_processed_items: Arc::new(StatsCounter::new()),
            global_retry_options,
            node_retry_options: RwLock::new(HashMap::new()),
            node_merge_capacity: RwLock::new(HashMap::new()),
            circuit_breakers,
            retry_delay,
            error_handler_factory,
            pipeline_error_handler: None,
            dead_letter_sinks: RwLock::new(HashMap::new()),
            branch_metrics: BranchMetricsRegistry::new(),
            observability_scopes: RwLock::new(HashMap::new()),
            observer,
            state_manager,
            parallel_execution: false,
            items: RwLock::new(HashMap::new()),
            last_retry_exhausted: RwLock::new(None),
            node_failure: Mutex::new(None),
        }
    }

    /// The run's unique id, used in tracing spans and metrics.
    #[must_use]
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// The pipeline's configured name.
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Wall-clock instant the run started, for elapsed-time metrics.
    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The shared `TotalProcessedItems` counter.
    #[must_use]
    pub fn total_processed_items(&self) -> &Arc<StatsCounter> {
        &self.total_processed_items
    }

    /// Resolves effective retry options for `node`: per-node override if
    /// registered, else the global default.
    #[must_use]
    pub fn retry_options_for(&self, node: &NodeId) -> RetryOptions {
        self.node_retry_options
            .read()
            .get(node)
            .cloned()
            .unwrap_or_else(|| self.global_retry_options.clone())
    }

    /// Registers a per-node retry override.
    pub fn set_retry_options_for(&self, node: NodeId, options: RetryOptions) {
        self.node_retry_options.write().insert(node, options);
    }

    /// Per-node merge-capacity override for `node`'s fan-in, if one was
    /// registered; falls back to the runner's global default otherwise.
    #[must_use]
    pub fn merge_capacity_for(&self, node: &NodeId) -> Option<usize> {
        self.node_merge_capacity.read().get(node).copied()
    }

    /// Registers a per-node merge-capacity override.
    pub fn set_merge_capacity_for(&self, node: NodeId, capacity: usize) {
        self.node_merge_capacity.write().insert(node, capacity);
    }

    /// The shared circuit breaker manager.
    #[must_use]
    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.circuit_breakers
    }

    /// The retry-delay strategy used by the error-handling service.
    #[must_use]
    pub fn retry_delay(&self) -> &Arc<dyn RetryDelay> {
        &self.retry_delay
    }

    /// The error-handler factory used to resolve node-level handlers.
    #[must_use]
    pub fn error_handler_factory(&self) -> &Arc<dyn ErrorHandlerFactory> {
        &self.error_handler_factory
    }

    /// Registers the pipeline-wide error handler, consulted before any
    /// node-level handler. Builder-style; call before the run starts.
    #[must_use]
    pub fn with_pipeline_error_handler(mut self, handler: Arc<dyn PipelineErrorHandler>) -> Self {
        self.pipeline_error_handler = Some(handler);
        self
    }

    /// The pipeline-wide error handler, if one is configured.
    #[must_use]
    pub fn pipeline_error_handler(&self) -> Option<&Arc<dyn PipelineErrorHandler>> {
        self.pipeline_error_handler.as_ref()
    }

    /// Registers a dead-letter sink instance for `node`.
    pub fn set_dead_letter_sink(&self, node: NodeId, sink: Arc<dyn DeadLetterSink>) {
        self.dead_letter_sinks.write().insert(node, sink);
    }

    /// Looks up the dead-letter sink registered for `node`, if any.
    #[must_use]
    pub fn dead_letter_sink(&self, node: &NodeId) -> Option<Arc<dyn DeadLetterSink>> {
        self.dead_letter_sinks.read().get(node).cloned()
    }

    /// The branch-metrics registry.
    #[must_use]
    pub fn branch_metrics(&self) -> &BranchMetricsRegistry {
        &self.branch_metrics
    }

    /// Registers the observability scope for `node`, keyed
    /// `NodeObservabilityScope::<nodeId>`.
    pub fn set_observability_scope(&self, node: NodeId, scope: Arc<NodeObservabilityScope>) {
        self.observability_scopes.write().insert(node, scope);
    }

    /// Looks up the observability scope registered for `node`.
    #[must_use]
    pub fn observability_scope(&self, node: &NodeId) -> Option<Arc<NodeObservabilityScope>> {
        self.observability_scopes.read().get(node).cloned()
    }

    /// The optional execution-observer sink for lifecycle events.
    #[must_use]
    pub fn observer(&self) -> Option<&Arc<dyn ExecutionObserver>> {
        self.observer.as_ref()
    }

    /// The optional persistence hook.
    #[must_use]
    pub fn state_manager(&self) -> &Arc<dyn StateManager> {
        &self.state_manager
    }

    /// Whether the run is executing under `ParallelExecution=true`
    /// semantics, for node/handler code that wants to branch on it.
    #[must_use]
    pub fn parallel_execution(&self) -> bool {
        self.parallel_execution
    }

    /// Sets the `ParallelExecution` flag. Intended to be set once, before
    /// the node whose strategy it governs begins executing.
    pub fn set_parallel_execution(&mut self, value: bool) {
        self.parallel_execution = value;
    }

    /// Records a rendering of the most recent `RetryExhausted` error,
    /// surfaced via the `LastRetryExhaustedException` context key
    ///. Stored as a message rather than the error value
    /// itself since [`crate::error::RunError`] boxes a non-`Clone` source
    /// and the context's role here is observability, not re-throwing.
    pub fn set_last_retry_exhausted(&self, message: impl Into<String>) {
        *self.last_retry_exhausted.write() = Some(message.into());
    }

    /// Reads the most recently recorded `RetryExhausted` rendering, if any.
    #[must_use]
    pub fn last_retry_exhausted(&self) -> Option<String> {
        self.last_retry_exhausted.read().clone()
    }

    /// Records that `node` failed terminally during its run, for the
    /// runner to surface after the DAG finishes draining. Only the first
    /// failure recorded per run is kept.
    pub fn record_node_failure(&self, error: crate::error::RunError) {
        let mut slot = self.node_failure.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Takes the first node failure recorded during the run, if any.
    pub fn take_node_failure(&self) -> Option<crate::error::RunError> {
        self.node_failure.lock().take()
    }

    /// Inserts an arbitrary extension value into the context's side-channel
    /// map, keyed by a caller-chosen string.
    pub fn insert_item(&self, key: impl Into<String>, value: Box<dyn std::any::Any + Send + Sync>) {
        self.items.write().insert(key.into(), value);
    }

    /// Reads and downcasts an extension value previously stored via
    /// [`Self::insert_item`].
    #[must_use]
    pub fn get_item<T: 'static + Clone>(&self, key: &str) -> Option<T> {
        self.items.read().get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }
}
