// SPDX-License-Identifier: Apache-2.0

//! The persistence hook: an optional post-node snapshot collaborator.
//! Concrete snapshot backends (database, object store, local disk) are
//! out of scope for the engine core — it ships only a no-op default and
//! a recording test double, and leaves the rest to whatever the host
//! application injects.

use crate::context::PipelineContext;
use crate::graph::NodeId;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Invoked after each node completes successfully. Failures are logged and
/// never fatal.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Creates a snapshot of whatever state the implementor cares about,
    /// after `node` finished successfully.
    async fn create_snapshot(&self, node: &NodeId, ctx: &PipelineContext, cancel: &CancellationToken) -> Result<(), String>;
}

/// A no-op [`StateManager`], the default when no persistence collaborator
/// is configured.
pub struct NullStateManager;

#[async_trait]
impl StateManager for NullStateManager {
    async fn create_snapshot(&self, _node: &NodeId, _ctx: &PipelineContext, _cancel: &CancellationToken) -> Result<(), String> {
        Ok(())
    }
}

/// A [`StateManager`] that records which nodes it was asked to snapshot,
/// for test assertions.
#[derive(Default)]
pub struct RecordingStateManager {
    snapshots: parking_lot::Mutex<Vec<NodeId>>,
}

impl RecordingStateManager {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        RecordingStateManager::default()
    }

    /// Returns the nodes snapshotted so far, in order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<NodeId> {
        self.snapshots.lock().clone()
    }
}

#[async_trait]
impl StateManager for RecordingStateManager {
    async fn create_snapshot(&self, node: &NodeId, _ctx: &PipelineContext, _cancel: &CancellationToken) -> Result<(), String> {
        self.snapshots.lock().push(node.clone());
        Ok(())
    }
}

/// Invokes `manager.create_snapshot`, logging (never propagating) a
/// failure — persistence is best-effort and must never fail a run.
pub async fn snapshot_after_success(
    manager: &dyn StateManager,
    node: &NodeId,
    ctx: &PipelineContext,
    cancel: &CancellationToken,
) {
    if let Err(message) = manager.create_snapshot(node, ctx, cancel).await {
        warn!(node = %node, error = %message, "persistence snapshot failed");
    }
}
