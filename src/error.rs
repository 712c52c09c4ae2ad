// SPDX-License-Identifier: Apache-2.0

//! Errors produced by the pipeline engine.
//!
//! Cancellation is never wrapped in [`RunError`] — callers observe it as a
//! `tokio_util::sync::CancellationToken` firing, not as a `Result::Err`.
//! Every other failure kind from the error-handling design surfaces as one
//! of the variants below, following the single-wrap rule: a
//! [`RunError::NodeExecution`] is never itself wrapped in another
//! `NodeExecution`.

use crate::graph::NodeId;
use std::fmt;

/// Coarse classification of a node-internal failure, used by error handlers
/// and dead-letter routing to decide whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The node raised an application-level error while processing an item.
    NodeInternal,
    /// A circuit breaker denied execution.
    CircuitOpen,
    /// Infrastructure collaborator (persistence, logger, metrics sink)
    /// failed; always non-fatal.
    Infrastructure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::NodeInternal => "node-internal",
            FailureKind::CircuitOpen => "circuit-open",
            FailureKind::Infrastructure => "infrastructure",
        };
        write!(f, "{label}")
    }
}

/// All errors that can be returned by the pipeline engine.
///
/// Cancellation is deliberately absent from this enum: a canceled run
/// propagates by the cancellation token firing and every suspension point
/// returning early, not through this error type.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    /// The pipeline graph failed validation before any node ran.
    #[error("invalid pipeline graph: {message}")]
    Config {
        /// Human-readable description of the validation failure.
        message: String,
    },

    /// A node exhausted its retry budget or was not configured to retry at
    /// all and the error handler chain decided to fail the pipeline.
    #[error("node `{node}` failed after {attempts} attempt(s): {source}")]
    NodeExecution {
        /// The node that failed.
        node: NodeId,
        /// Number of attempts made (always >= 1).
        attempts: u32,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A node's circuit breaker denied execution and no fallback was
    /// configured.
    #[error("circuit breaker open for node `{node}`")]
    CircuitBreakerTripped {
        /// The node whose breaker is open.
        node: NodeId,
    },

    /// A pipeline-level or node-level error handler was misconfigured, e.g.
    /// it returned `RestartNode` for a node that is not wrapped in the
    /// resilient execution strategy.
    #[error("error-handling misconfiguration for node `{node}`: {message}")]
    ErrorHandlerConfig {
        /// The node for which the misconfiguration was detected.
        node: NodeId,
        /// Description of the misconfiguration.
        message: String,
    },

    /// A bounded dead-letter sink rejected an item because it was full.
    #[error("dead-letter sink for node `{node}` is full (capacity {capacity})")]
    DeadLetterSinkFull {
        /// The node whose failing item could not be dead-lettered.
        node: NodeId,
        /// The sink's configured capacity.
        capacity: usize,
    },

    /// An internal invariant was violated; always a bug in the engine
    /// itself rather than in user-supplied nodes or configuration.
    #[error("internal engine error: {message}")]
    Internal {
        /// Description of the invariant violation.
        message: String,
    },
}

impl RunError {
    /// Wraps a node-internal failure as [`RunError::NodeExecution`], unless
    /// `source` is already a [`RunError`] (in which case it is returned
    /// unchanged to satisfy the single-wrap rule).
    pub fn node_execution(
        node: NodeId,
        attempts: u32,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> RunError {
        match source.downcast::<RunError>() {
            Ok(already) => *already,
            Err(source) => RunError::NodeExecution {
                node,
                attempts,
                source,
            },
        }
    }

    /// Returns `true` if this error already represents a terminal,
    /// non-retriable pipeline failure (as opposed to a per-item failure
    /// that error handling might still recover from).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunError::NodeExecution { .. }
                | RunError::CircuitBreakerTripped { .. }
                | RunError::ErrorHandlerConfig { .. }
                | RunError::Config { .. }
                | RunError::Internal { .. }
        )
    }
}
