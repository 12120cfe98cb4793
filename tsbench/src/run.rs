//! Wiring an executor run to its stats aggregator.

use std::io::Write;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::executor::{Decoder, Executor, ExecutorReport, Handler, WorkItem};
use crate::stats::{StatsAggregator, StatsSettings, Summary};

/// Outcome of a complete benchmark run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// Executor counters.
    pub report: ExecutorReport,
    /// Aggregated statistics.
    pub stats: Summary,
    /// Time from start until the final snapshot was written.
    pub wall_clock: Duration,
}

/// Runs `decoder` through `executor` while a stats task aggregates the latencies.
///
/// Periodic snapshots go to `periodic`, the final one to `primary`. Both the executor and the
/// stats task are always awaited; the executor's error takes precedence. Nothing is written to
/// `primary` unless the run succeeds.
pub async fn run_benchmark<T, D, H, F, P, W>(
    executor: &Executor<T>,
    decoder: D,
    make_handler: F,
    settings: StatsSettings,
    periodic: P,
    mut primary: W,
) -> Result<RunSummary>
where
    T: WorkItem,
    D: Decoder<Item = T>,
    H: Handler<Item = T>,
    F: FnMut(usize) -> Result<H>,
    P: Write + Send + 'static,
    W: Write,
{
    let start = Instant::now();
    let workers = executor.config().workers.max(1);
    let (sender, receiver) = mpsc::channel(workers);

    let aggregator = StatsAggregator::new(settings);
    let stats_task = tokio::spawn(aggregator.run(receiver, executor.stat_pool().clone(), periodic));

    let executed = executor.run(decoder, make_handler, sender).await;
    let aggregated = stats_task
        .await
        .map_err(|e| Error::WorkerPanicked(e.to_string()))
        .and_then(|r| r);

    // A failed run produces no final snapshot.
    let report = executed?;
    let aggregator = aggregated?;

    aggregator.write_final(&mut primary)?;
    Ok(RunSummary {
        report,
        stats: aggregator.summary(),
        wall_clock: start.elapsed(),
    })
}
