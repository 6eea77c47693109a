use thiserror::Error;

/// Unified error type for the four kinds the engine can surface: caller
/// misuse, logical absence, allocation exhaustion, and storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// Logical absence or trie disambiguation miss. Not exceptional — callers
    /// are expected to match on this.
    #[error("not found")]
    Fail,

    #[error("allocation failed: {0}")]
    AllocFail(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
