//! Crate-level error taxonomy.
//!
//! Module-local error enums (`LmError`, `ToolError`, `CheckpointError`,
//! `TaskStoreError`) convert into [`HarnessError`] at the component seams.
//! Goal-scope failures never panic: they end up either fed back to the model
//! as tool messages or surfaced through this type to the orchestrator.

use thiserror::Error;

use crate::classify::Failure;

/// A type alias for `Result<T, HarnessError>`.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// The main error type for harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Invalid or unreadable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The workspace could not be prepared for checkpointing.
    ///
    /// Best-effort downgrade: checkpointing is disabled and execution
    /// continues.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// The system layer alone no longer fits the token budget.
    ///
    /// Surfaced to the orchestrator, never to the model.
    #[error("context overflow: estimated {estimated} tokens exceeds budget {budget}")]
    ContextOverflow {
        /// Estimated size of the smallest possible message list.
        estimated: usize,
        /// The budget that could not be met.
        budget: usize,
    },

    /// The compensation pipeline consumed every strategy without producing a
    /// usable turn. Ends the current plan step.
    #[error("compensation exhausted after {attempts} attempts: {failure}")]
    CompensationExhausted {
        /// Attempts made before giving up.
        attempts: usize,
        /// The final classified failure.
        failure: Failure,
    },

    /// Error from the LM transport.
    #[error(transparent)]
    Lm(#[from] crate::llm::LmError),

    /// Error from the task store.
    #[error(transparent)]
    TaskStore(#[from] crate::tasks::TaskStoreError),

    /// Error from the checkpoint manager that could not be downgraded.
    #[error(transparent)]
    Checkpoint(#[from] crate::checkpoint::CheckpointError),

    /// The goal's cancel token fired.
    #[error("cancelled")]
    Cancelled,

    /// Invariant breach or other internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
