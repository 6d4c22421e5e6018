//! # Query Module
//!
//! Statement trees, their rendering into driver-specific SQL and the compiler
//! that turns document filters into conditions.

pub mod ast;
pub mod filter;
pub mod serializer;

pub use filter::{encode_filter, Projection, QueryBuilder};
pub use serializer::{Serializer, Sql};
