//! Model scoring helpers that compare an actual column with a predicted one.
pub mod comparison;

pub use comparison::{CompareOptions, Comparison};
