// SPDX-License-Identifier: Apache-2.0

//! Total-order fan-in merge: drains each input fully, in declaration
//! order, before moving to the next.

use super::MergeStrategy;
use crate::pipe::{BoxedPipe, Pipe};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Merges N input pipes by reading input 0 to completion, then input 1,
/// and so on. The merged output is exactly the concatenation of each
/// input's sequence.
#[derive(Debug, Default, Clone, Copy)]
pub struct Concatenate;

struct ConcatenatedPipe<T> {
    name: Arc<str>,
    inputs: VecDeque<BoxedPipe<T>>,
}

#[async_trait]
impl<T: Send + 'static> Pipe<T> for ConcatenatedPipe<T> {
    async fn next(&mut self) -> Option<T> {
        loop {
            let front = self.inputs.front_mut()?;
            match front.next().await {
                Some(item) => return Some(item),
                None => {
                    let mut done = self.inputs.pop_front().expect("front just matched");
                    done.dispose();
                }
            }
        }
    }

    fn stream_name(&self) -> &str {
        &self.name
    }

    fn dispose(&mut self) {
        for input in &mut self.inputs {
            input.dispose();
        }
        self.inputs.clear();
    }
}

#[async_trait]
impl<T: Send + 'static> MergeStrategy<T> for Concatenate {
    async fn merge(
        &self,
        merged_name: &str,
        inputs: Vec<BoxedPipe<T>>,
        _cancel: CancellationToken,
    ) -> BoxedPipe<T> {
        if inputs.len() == 1 {
            return inputs.into_iter().next().expect("length checked");
        }
        Box::new(ConcatenatedPipe {
            name: merged_name.into(),
            inputs: inputs.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{drain_to_vec, InMemoryPipe};

    #[tokio::test]
    async fn concatenates_inputs_in_declaration_order() {
        let merge = Concatenate;
        let a: BoxedPipe<i32> = Box::new(InMemoryPipe::new("a", vec![1, 2]));
        let b: BoxedPipe<i32> = Box::new(InMemoryPipe::new("b", vec![3, 4]));
        let merged = merge.merge("m", vec![a, b], CancellationToken::new()).await;
        assert_eq!(drain_to_vec(merged).await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn single_input_is_passed_through_unwrapped() {
        let merge = Concatenate;
        let a: BoxedPipe<i32> = Box::new(InMemoryPipe::new("a", vec![1, 2, 3]));
        let merged = merge.merge("m", vec![a], CancellationToken::new()).await;
        assert_eq!(drain_to_vec(merged).await, vec![1, 2, 3]);
    }
}
