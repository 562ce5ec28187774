//! In-memory row primitives used by the stages.
//!
//! - [`reduce()`]: column reductions (count/sum/mean/min/max)
//! - [`group`]: key extraction, grouping by key and duplicate detection
//!
//! ## Example: mean of a numeric column
//!
//! ```rust
//! use tabular_console::processing::{reduce, ReduceOp};
//! use tabular_console::types::{DataType, Field, RowSet, Schema, Value};
//!
//! let rows = RowSet::new(
//!     Schema::new(vec![Field::new("score", DataType::Float64)]),
//!     vec![vec![Value::Float64(10.0)], vec![Value::Null], vec![Value::Float64(5.0)]],
//! );
//! assert_eq!(reduce(&rows, "score", ReduceOp::Mean), Some(Value::Float64(7.5)));
//! ```

pub mod group;
pub mod reduce;

pub use reduce::{reduce, ReduceOp};
