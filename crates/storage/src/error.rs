use thiserror::Error;

/// Errors surfaced by the in-memory content store.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum StoreError {
    /// Entry index is past the end of the entry table
    #[error("entry index {index} out of range (entries: {len})")]
    OutOfRange { index: usize, len: usize },

    /// No entry or delimiter pair exists for the requested format
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
