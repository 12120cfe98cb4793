//! A benchmarking suite for time series databases.
//!
//! The suite is split into offline generators and online benchmarks:
//!
//! - [`data_gen`] simulates a fleet of hosts reporting `cpu` measurements, which
//!   [`serializer`] writes in one of several text [`Format`](serializer::Format)s.
//! - [`query_gen`] produces a [`Query`](query::Query) workload over the same hosts, stored as a
//!   binary query stream.
//! - [`load`] and [`bench`] replay those files against a [`target`], driven by the concurrent
//!   [`executor`] while [`stats`] reports latencies.
//!
//! Generators are deterministic for a fixed seed, so two runs of the same configuration produce
//! byte-identical output.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use rand::SeedableRng;
use rand::rngs::SmallRng;

pub mod bench;
pub mod cli;
pub mod config;
pub mod data_gen;
pub mod error;
pub mod executor;
pub mod interval;
pub mod load;
pub mod observability;
pub mod point;
pub mod pool;
pub mod query;
pub mod query_gen;
pub mod run;
pub mod serializer;
pub mod stats;
pub mod target;

pub use crate::error::{Error, Result};

/// Seed used by the generators unless configured otherwise.
pub const DEFAULT_SEED: u64 = 123;

/// Creates the random source of a generator, seeded from entropy if `seed` is `None`.
pub fn seeded_rng(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    }
}
