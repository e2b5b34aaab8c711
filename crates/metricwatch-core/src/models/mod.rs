//! Data models for Metricwatch

mod criterion;
mod evaluation;
mod filter;

pub use criterion::*;
pub use evaluation::*;
pub use filter::*;
