//! Target systems a benchmark writes to and queries.
//!
//! The harness only depends on the [`Appender`] and [`Querier`] capabilities. Two targets ship
//! with it: an [in-memory TSDB](in_memory::InMemoryTsdb) that supports both, and a write-only
//! [HTTP line-protocol client](http::HttpAppender).

mod aggregate;
mod common;
pub mod http;
pub mod in_memory;

pub use aggregate::{Aggregation, StepAggregator};
pub use common::*;
