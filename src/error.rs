//! The possible error types when using `liquid_frame`.
use crate::kv::Key;
use thiserror::Error;

/// An enumeration of `liquid_frame` errors.
///
/// Errors fall into two families. *Usage* errors are raised when a
/// precondition is checked, before any partition work starts, and retrying
/// them without changing the input is pointless. *Execution* errors are raised
/// while a map-reduce task runs and abort the whole task. Use
/// [`LiquidError::is_usage`] to tell them apart.
#[derive(Error, Debug)]
pub enum LiquidError {
    /// A required column was not supplied or could not be resolved
    #[error("Missing column: {0}")]
    MissingColumn(String),
    /// Two columns that must have the same number of rows do not
    #[error("Both columns must have the same length ({left} != {right})")]
    LengthMismatch { left: u64, right: u64 },
    /// The requested operation doesn't match the column or chunk type
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    /// The given `Key` is not present in the directory
    #[error("Key {0} is not present")]
    NotPresent(Key),
    /// Input columns of a task do not share one partition layout
    #[error("Input columns do not share the same partition layout")]
    Misaligned,
    /// A column name is already used in a frame
    #[error("Name already in use: {0}")]
    NameAlreadyExists(String),
    /// A key is already published in the directory
    #[error("Key {0} is already published")]
    KeyAlreadyExists(Key),
    #[error("Row index out of bounds")]
    RowIndexOutOfBounds,
    #[error("Col index out of bounds")]
    ColIndexOutOfBounds,
    /// A categorical domain or code is invalid
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
    /// A partition layout is malformed
    #[error("Invalid layout: {0}")]
    InvalidLayout(String),
    /// A request named an api version that is not served
    #[error("Unsupported api version: {0}")]
    UnsupportedVersion(u32),
    /// The cloud configuration can not be used
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// A per-partition or merge step failed
    #[error("Task failed on partition {partition}: {source}")]
    TaskFailed {
        partition: usize,
        #[source]
        source: Box<LiquidError>,
    },
    /// A task failed for a reason not tied to one partition
    #[error("Execution failed: {0}")]
    Execution(String),
    /// The task was cancelled before it completed
    #[error("Task was cancelled")]
    Cancelled,
    /// A node did not answer a request
    #[error("Node {0} is unreachable")]
    NodeUnreachable(usize),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl LiquidError {
    /// Whether this error is a usage error, i.e. a violated precondition
    /// that is reported before any partition work starts.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            LiquidError::MissingColumn(_)
                | LiquidError::LengthMismatch { .. }
                | LiquidError::TypeMismatch(_)
                | LiquidError::NotPresent(_)
                | LiquidError::Misaligned
                | LiquidError::NameAlreadyExists(_)
                | LiquidError::KeyAlreadyExists(_)
                | LiquidError::RowIndexOutOfBounds
                | LiquidError::ColIndexOutOfBounds
                | LiquidError::InvalidDomain(_)
                | LiquidError::InvalidLayout(_)
                | LiquidError::UnsupportedVersion(_)
                | LiquidError::Config(_)
        )
    }
}
