// SPDX-License-Identifier: Apache-2.0

//! Fair, order-preserving-per-input fan-in merge.

use super::MergeStrategy;
use crate::pipe::{BoxedPipe, Pipe, StreamingPipe};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Merges N input pipes by racing them: each gets a dedicated producer
/// task that drains into a shared bounded queue, so no single input can
/// starve the others, and each input's relative order is preserved.
///
/// When the node declares a per-subscriber/merge capacity the queue is
/// bounded, which propagates backpressure to whichever input is fastest.
pub struct Interleave {
    capacity: usize,
}

impl Interleave {
    /// Builds an interleave merge with the given queue capacity. A
    /// capacity of `0` is treated as `1` (tokio's mpsc requires a
    /// positive bound; there is no unbounded variant in this engine).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Interleave {
            capacity: capacity.max(1),
        }
    }
}

impl Default for Interleave {
    fn default() -> Self {
        Interleave::new(64)
    }
}

#[async_trait]
impl<T: Send + 'static> MergeStrategy<T> for Interleave {
    async fn merge(
        &self,
        merged_name: &str,
        inputs: Vec<BoxedPipe<T>>,
        cancel: CancellationToken,
    ) -> BoxedPipe<T> {
        if inputs.len() == 1 {
            return inputs.into_iter().next().expect("length checked");
        }

        let (tx, pipe) = StreamingPipe::channel(merged_name.to_owned(), self.capacity);
        let producer_count = inputs.len();
        for mut input in inputs {
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        item = input.next() => {
                            match item {
                                Some(item) => {
                                    if tx.send(item).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    }
                }
                input.dispose();
            });
        }
        drop(tx);
        let _ = producer_count;
        Box::new(pipe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{drain_to_vec, InMemoryPipe};
    use std::collections::HashSet;

    #[tokio::test]
    async fn single_input_is_passed_through_unwrapped() {
        let merge = Interleave::default();
        let input: BoxedPipe<i32> = Box::new(InMemoryPipe::new("a", vec![1, 2, 3]));
        let merged = merge.merge("m", vec![input], CancellationToken::new()).await;
        assert_eq!(drain_to_vec(merged).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn preserves_per_input_order_and_loses_no_items() {
        let merge = Interleave::default();
        let a: BoxedPipe<i32> = Box::new(InMemoryPipe::new("a", vec![1, 2, 3]));
        let b: BoxedPipe<i32> = Box::new(InMemoryPipe::new("b", vec![10, 20, 30]));
        let merged = merge.merge("m", vec![a, b], CancellationToken::new()).await;
        let items = drain_to_vec(merged).await;
        assert_eq!(items.len(), 6);
        let from_a: Vec<i32> = items.iter().copied().filter(|x| *x < 10).collect();
        let from_b: Vec<i32> = items.iter().copied().filter(|x| *x >= 10).collect();
        assert_eq!(from_a, vec![1, 2, 3]);
        assert_eq!(from_b, vec![10, 20, 30]);
        let set: HashSet<i32> = items.into_iter().collect();
        assert_eq!(set.len(), 6);
    }
}
