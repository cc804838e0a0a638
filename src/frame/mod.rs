//! A module for creating and reading distributed columnar data.
//!
//! Data lives in three layers:
//!
//! # [`Chunk`](crate::frame::chunk::Chunk)
//!
//! A contiguous run of rows of one column, compressed with whichever
//! encoding reproduces every value exactly. A chunk is the unit of storage
//! in the directory and the unit of work handed to a task.
//!
//! # [`Column`](crate::frame::column::Column)
//!
//! The metadata of a column: its `Key`, its [`Layout`] (where each chunk
//! starts and which node is its home), its type and, for categorical
//! columns, its domain. Reading a value fetches the chunk that holds it.
//!
//! # [`Frame`](crate::frame::frame::Frame)
//!
//! An ordered list of named columns that all share one layout.
//!
//! The [`rollups`] and [`domain`] modules build statistics and categorical
//! conversions on top of these, using the task engine in [`crate::mr`].
pub mod chunk;
pub mod column;
pub mod domain;
#[allow(clippy::module_inception)]
pub mod frame;
pub mod rollups;

pub use chunk::{Chunk, Values};
pub use column::{Column, ColumnData, ColumnType, Layout};
pub use frame::Frame;
pub use rollups::Rollups;
