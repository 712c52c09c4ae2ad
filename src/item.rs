// SPDX-License-Identifier: Apache-2.0

//! Type-erased pipeline items and the adapter pipes that convert between a
//! strongly-typed [`Pipe<T>`] and the erased [`Pipe<PItem>`] the runner
//! drives a DAG with.
//!
//! Join and merge services need to handle heterogeneous element types,
//! which calls for something like an erased iterator over `object?`. Rust
//! has no such supertype, so this module plays that role with a `Box<dyn
//! Any + Send>` plus a captured `TypeId`/type name for the non-Join
//! type-filtering check. Nodes themselves are written against plain,
//! strongly-typed [`Pipe<T>`]s (see [`crate::node`]); only the
//! plan/runner boundary deals in [`PItem`].

use crate::pipe::{BoxedPipe, Pipe};
use std::any::{Any, TypeId};
use std::fmt;

/// One item flowing through the runner's erased plumbing: a value of some
/// concrete `T`, tagged with its `TypeId` and a human-readable type name
/// for error messages and the `BranchMetrics`/dead-letter debug rendering.
pub struct PItem {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send>,
}

impl PItem {
    /// Wraps a concrete value as an erased item.
    pub fn new<T: Send + 'static>(value: T) -> Self {
        PItem {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    /// The `TypeId` of the wrapped value, used for the non-Join fan-in
    /// type-filtering check.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// A human-readable name of the wrapped value's type.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Recovers the concrete value, or hands the item back unchanged if
    /// `T` does not match what was wrapped.
    pub fn downcast<T: Send + 'static>(self) -> Result<T, PItem> {
        if self.value.is::<T>() {
            Ok(*self
                .value
                .downcast::<T>()
                .unwrap_or_else(|_| unreachable!("type just checked via Any::is")))
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for PItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PItem").field("type_name", &self.type_name).finish()
    }
}

/// Erases a strongly-typed pipe into `Pipe<PItem>`, used wherever a node's
/// output must be handed to the runner's generic DAG-walking code.
pub struct Erase<T> {
    inner: BoxedPipe<T>,
}

impl<T: Send + 'static> Erase<T> {
    /// Wraps `inner`, erasing each yielded item.
    pub fn new(inner: BoxedPipe<T>) -> Self {
        Erase { inner }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Pipe<PItem> for Erase<T> {
    async fn next(&mut self) -> Option<PItem> {
        self.inner.next().await.map(PItem::new)
    }

    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

/// Un-erases a `Pipe<PItem>` back into a strongly-typed `Pipe<T>`.
///
/// A downcast mismatch can only happen if a node was invoked with an item
/// the pipe-merge service's type filter should have excluded — an internal
/// invariant violation, not a user-reachable condition. Rather than panic
/// inside a spawned task (which would silently abort the producer), a
/// mismatch is logged and treated as end-of-stream for the offending item:
/// the item is dropped and iteration continues.
pub struct Unerase<T> {
    inner: BoxedPipe<PItem>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Send + 'static> Unerase<T> {
    /// Wraps `inner`, downcasting each yielded item to `T`.
    pub fn new(inner: BoxedPipe<PItem>) -> Self {
        Unerase {
            inner,
            _marker: std::marker::PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<T: Send + 'static> Pipe<T> for Unerase<T> {
    async fn next(&mut self) -> Option<T> {
        loop {
            let item = self.inner.next().await?;
            match item.downcast::<T>() {
                Ok(value) => return Some(value),
                Err(mismatched) => {
                    tracing::error!(
                        expected = std::any::type_name::<T>(),
                        actual = mismatched.type_name(),
                        "dropping item of unexpected type reaching a typed pipe boundary"
                    );
                }
            }
        }
    }

    fn stream_name(&self) -> &str {
        self.inner.stream_name()
    }

    fn dispose(&mut self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{drain_to_vec, InMemoryPipe};

    #[tokio::test]
    async fn erase_then_unerase_round_trips_items() {
        let typed: BoxedPipe<i32> = Box::new(InMemoryPipe::new("t", vec![1, 2, 3]));
        let erased: BoxedPipe<PItem> = Box::new(Erase::new(typed));
        let back: BoxedPipe<i32> = Box::new(Unerase::new(erased));
        assert_eq!(drain_to_vec(back).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unerase_drops_items_of_the_wrong_type() {
        let mixed: BoxedPipe<PItem> = Box::new(InMemoryPipe::new(
            "mixed",
            vec![PItem::new(1_i32), PItem::new("not an i32".to_owned()), PItem::new(2_i32)],
        ));
        let typed: BoxedPipe<i32> = Box::new(Unerase::new(mixed));
        assert_eq!(drain_to_vec(typed).await, vec![1, 2]);
    }
}
