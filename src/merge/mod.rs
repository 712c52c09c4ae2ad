// SPDX-License-Identifier: Apache-2.0

//! Fan-in merge strategies: combine N upstream pipes of `T` into one.
//!
//! Each strategy owns a dedicated task per input that drains into a
//! shared queue; the consumer end is handed to whoever reads next.

mod interleave;
mod concatenate;

pub use concatenate::Concatenate;
pub use interleave::Interleave;

use crate::pipe::BoxedPipe;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Fuses the outputs of several upstream pipes into a single pipe of `T`.
///
/// Implementations own the fan-in mechanism (channel, ordered drain); they
/// do not perform type filtering on non-`Join` nodes — that is the
/// pipe-merge service's job (see [`crate::pipe_merge`]).
#[async_trait]
pub trait MergeStrategy<T: Send + 'static>: Send + Sync {
    /// Merges `inputs` into a single pipe, named `merged_name`.
    async fn merge(
        &self,
        merged_name: &str,
        inputs: Vec<BoxedPipe<T>>,
        cancel: CancellationToken,
    ) -> BoxedPipe<T>;
}

/// A node-supplied custom merge function, boxed so it can be stored
/// alongside the built-in strategies.
pub type CustomMergeFn<T> = Box<
    dyn Fn(&str, Vec<BoxedPipe<T>>, CancellationToken) -> futures::future::BoxFuture<'static, BoxedPipe<T>>
        + Send
        + Sync,
>;

/// Wraps a [`CustomMergeFn`] as a [`MergeStrategy`].
pub struct Custom<T> {
    func: CustomMergeFn<T>,
}

impl<T: Send + 'static> Custom<T> {
    /// Wraps `func` as a merge strategy.
    pub fn new(func: CustomMergeFn<T>) -> Self {
        Custom { func }
    }
}

#[async_trait]
impl<T: Send + 'static> MergeStrategy<T> for Custom<T> {
    async fn merge(
        &self,
        merged_name: &str,
        inputs: Vec<BoxedPipe<T>>,
        cancel: CancellationToken,
    ) -> BoxedPipe<T> {
        (self.func)(merged_name, inputs, cancel).await
    }
}
