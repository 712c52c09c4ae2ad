// SPDX-License-Identifier: Apache-2.0

//! The pipe-merge service: selects and invokes the
//! per-node fan-in strategy (Interleave default, Concatenate, or a
//! node-supplied custom merge) over a node's already erased, already
//! type-validated inbound pipes.
//!
//! Type filtering itself — every input's element type must equal the
//! node's declared input type, or it's a configuration error raised
//! before the run starts — is done once by
//! [`crate::plan::validate_edge_types`]; this service only ever sees
//! inputs that already passed that check.

use crate::error::RunError;
use crate::graph::{MergeStrategyKind, NodeDefinition};
use crate::item::PItem;
use crate::merge::{Concatenate, Interleave, MergeStrategy};
use crate::pipe::{BoxedPipe, InMemoryPipe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A node-supplied custom merge for erased items, registered out-of-band
/// from the built-in Interleave/Concatenate strategies.
pub type CustomMergeStrategy = dyn MergeStrategy<PItem>;

/// Resolves a node's declared custom merge strategy by the name it was
/// registered under. Must never throw for an unresolvable name — return
/// `None` instead, which the merge service turns into a configuration
/// error.
pub trait CustomMergeFactory: Send + Sync {
    /// Instantiates the custom merge strategy registered under `name`, if
    /// any.
    fn create_custom_merge(&self, name: &str) -> Option<Arc<CustomMergeStrategy>>;
}

/// Selects and runs the configured fan-in strategy for one node.
pub struct PipeMergeService {
    default_capacity: usize,
}

impl PipeMergeService {
    /// Builds a service using `default_capacity` for nodes that don't
    /// declare a more specific per-node merge capacity.
    #[must_use]
    pub fn new(default_capacity: usize) -> Self {
        PipeMergeService { default_capacity }
    }

    /// Fuses `inputs` (one pipe per inbound edge, in declaration order)
    /// according to `node`'s configured merge strategy.
    pub async fn merge(
        &self,
        node: &NodeDefinition,
        inputs: Vec<BoxedPipe<PItem>>,
        custom: Option<&CustomMergeStrategy>,
        merge_capacity: Option<usize>,
        cancel: CancellationToken,
    ) -> Result<BoxedPipe<PItem>, RunError> {
        if inputs.is_empty() {
            return Ok(Box::new(InMemoryPipe::new(format!("{}-merged-empty", node.id), Vec::new())));
        }
        if inputs.len() == 1 {
            return Ok(inputs.into_iter().next().expect("length checked"));
        }

        let merged_name = format!("{}-merged", node.id);
        let capacity = merge_capacity.unwrap_or(self.default_capacity);

        match &node.merge_strategy {
            MergeStrategyKind::Interleave => Ok(Interleave::new(capacity).merge(&merged_name, inputs, cancel).await),
            MergeStrategyKind::Concatenate => Ok(Concatenate.merge(&merged_name, inputs, cancel).await),
            MergeStrategyKind::Custom(name) => match custom {
                Some(strategy) => Ok(strategy.merge(&merged_name, inputs, cancel).await),
                None => Err(RunError::Config {
                    message: format!("node `{}` declares custom merge strategy `{name}` but none was registered", node.id),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ExecutionStrategyRef, NodeKind};
    use crate::pipe::drain_to_vec;

    fn node(strategy: MergeStrategyKind) -> NodeDefinition {
        let mut n = NodeDefinition::new("n", NodeKind::Transform, ExecutionStrategyRef::Sequential);
        n.merge_strategy = strategy;
        n
    }

    #[tokio::test]
    async fn interleave_default_merges_all_inputs() {
        let service = PipeMergeService::new(16);
        let a: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("a", vec![PItem::new(1_i32), PItem::new(2_i32)]));
        let b: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("b", vec![PItem::new(3_i32)]));
        let merged = service
            .merge(&node(MergeStrategyKind::Interleave), vec![a, b], None, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drain_to_vec(merged).await.len(), 3);
    }

    #[tokio::test]
    async fn custom_without_registration_is_a_config_error() {
        let service = PipeMergeService::new(16);
        let a: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("a", vec![PItem::new(1_i32)]));
        let b: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("b", vec![PItem::new(2_i32)]));
        let result = service
            .merge(&node(MergeStrategyKind::Custom("reverse".to_owned())), vec![a, b], None, None, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RunError::Config { .. })));
    }

    struct ReverseConcat;

    #[async_trait::async_trait]
    impl MergeStrategy<PItem> for ReverseConcat {
        async fn merge(&self, merged_name: &str, mut inputs: Vec<BoxedPipe<PItem>>, cancel: CancellationToken) -> BoxedPipe<PItem> {
            inputs.reverse();
            Concatenate.merge(merged_name, inputs, cancel).await
        }
    }

    #[tokio::test]
    async fn registered_custom_merge_is_actually_invoked() {
        let service = PipeMergeService::new(16);
        let a: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("a", vec![PItem::new(1_i32)]));
        let b: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("b", vec![PItem::new(2_i32)]));
        let custom = ReverseConcat;
        let merged = service
            .merge(
                &node(MergeStrategyKind::Custom("reverse".to_owned())),
                vec![a, b],
                Some(&custom),
                None,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let items: Vec<i32> = drain_to_vec(merged)
            .await
            .into_iter()
            .map(|item| item.downcast::<i32>().unwrap_or_else(|_| panic!("expected i32")))
            .collect();
        assert_eq!(items, vec![2, 1]);
    }

    #[tokio::test]
    async fn single_input_is_passthrough() {
        let service = PipeMergeService::new(16);
        let a: BoxedPipe<PItem> = Box::new(InMemoryPipe::new("a", vec![PItem::new(1_i32)]));
        let merged = service
            .merge(&node(MergeStrategyKind::Interleave), vec![a], None, None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(drain_to_vec(merged).await.len(), 1);
    }
}
