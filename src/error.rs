//! Domain error types
//!
//! Validation and business errors propagate back to the command caller and
//! do not disturb engine state. `InvariantViolation` is engine-fatal: it
//! halts the symbol worker that raised it.

use thiserror::Error;

/// Errors surfaced by the engine, stores and publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Bad input, surfaced to the caller
    #[error("validation error: {0}")]
    Validation(String),

    /// Pre-match balance check failed
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Cancel applied to a terminal or foreign order
    #[error("order is not cancellable")]
    NotCancellable,

    /// Order / symbol / user not found
    #[error("not found")]
    NotFound,

    /// Command queue is full
    #[error("engine busy, queue full")]
    Busy,

    /// Command exceeded its per-command timeout
    #[error("timed out")]
    TimedOut,

    /// Subscriber outbound queue overflowed
    #[error("slow consumer")]
    SlowConsumer,

    /// Asset accounting broke - the symbol worker halts
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Idempotent cancel of an already-terminal order
    #[error("order already terminal")]
    AlreadyTerminal,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// True for errors that must halt the symbol worker.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
