//! # liquid_frame
//!
//! An in-memory columnar data engine spread over a cloud of nodes.
//!
//! A [`Cloud`] starts a number of nodes, each running a
//! [`KVStore`](crate::kv::KVStore) that holds the chunks homed on it. Columns
//! are published with [`Cloud::new_column`] and grouped into
//! [`Frame`](crate::frame::Frame)s. Work over columns is written as an
//! [`MrTask`](crate::mr::MrTask): `map` runs on every chunk on the node that
//! owns it, and the partial results are merged pairwise until one is left.
//!
//! On top of the engine the crate provides per column statistics
//! ([`Rollups`](crate::frame::Rollups)), categorical domain reconciliation,
//! confusion matrices and mean squared errors
//! ([`Comparison`](crate::hex::Comparison)) and a versioned inspection api
//! ([`api::inspect`]).
pub mod api;
pub mod cloud;
pub mod error;
pub mod frame;
pub mod hex;
pub mod kv;
pub mod mr;
pub mod network;

pub use cloud::{Cloud, CloudConfig};
pub use error::LiquidError;

/// The number of rows in each chunk of a new column, unless configured
pub const ROW_COUNT_PER_CHUNK: u64 = 100_000;
