//! Command line entry point of the benchmarking suite.
//!
//! See [`tsbench::cli`] for the available subcommands.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

fn main() -> anyhow::Result<()> {
    tsbench::cli::execute()
}
