#![forbid(unsafe_code)]
//! Error types for bytestash.
//!
//! Defines `StashError` and a `Result<T>` alias used throughout the
//! workspace.

use thiserror::Error;

/// Unified error type for all bytestash operations.
#[derive(Debug, Error)]
pub enum StashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("incomplete first edit: slot {slot} was never written")]
    Incomplete { slot: usize },

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("busy: an edit is in flight for this key")]
    Busy,
}

/// Result alias using `StashError`.
pub type Result<T> = std::result::Result<T, StashError>;
