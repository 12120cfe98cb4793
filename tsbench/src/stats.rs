//! Online latency statistics.
//!
//! Workers emit one [`Stat`] per measured operation (plus one per sub-phase). A single
//! [`StatsAggregator`] task consumes them, folds them into label-keyed [`StatGroup`]s and writes
//! periodic and final snapshots. Samples flagged [`is_actual`](Stat::is_actual) are the rollup
//! samples: they drive burn-in, print intervals and the global group.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use sketches_ddsketch::DDSketch;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::pool::{Pool, Recycle};

/// Global group label of query benchmarks.
pub const ALL_QUERIES: &str = "all queries";
/// Global group label of write benchmarks.
pub const ALL_WRITES: &str = "all writes";

/// One latency sample in milliseconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Stat {
    /// Label the sample is grouped under.
    pub label: String,
    /// Latency in milliseconds.
    pub value: f64,
    /// Whether this is the rollup sample of an operation.
    pub is_actual: bool,
}

impl Stat {
    /// Fills the stat, reusing the label allocation.
    pub fn set(&mut self, label: &str, value: f64, is_actual: bool) {
        self.label.clear();
        self.label.push_str(label);
        self.value = value;
        self.is_actual = is_actual;
    }
}

impl Recycle for Stat {
    fn recycle(&mut self) {
        self.label.clear();
        self.value = 0.0;
        self.is_actual = false;
    }
}

/// Online summary of a stream of values.
#[derive(Clone, Default)]
pub struct StatGroup {
    count: u64,
    sum: f64,
    mean: f64,
    min: f64,
    max: f64,
    sketch: DDSketch,
}

impl StatGroup {
    /// Folds one value into the group.
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.mean += (value - self.mean) / self.count as f64;
        self.sketch.add(value);
    }

    /// Number of values.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of all values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Running mean.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Smallest value, `0` if empty.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest value, `0` if empty.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Approximate quantile `q` in `[0, 1]`, `0` if empty.
    pub fn quantile(&self, q: f64) -> f64 {
        self.sketch.quantile(q).ok().flatten().unwrap_or_default()
    }

    fn write_line(&self, w: &mut dyn Write, label: &str, width: usize) -> io::Result<()> {
        writeln!(
            w,
            "{label:<width$} : min: {:8.2}ms ({:7.2}/sec), mean: {:8.2}ms ({:7.2}/sec), \
             max: {:7.2}ms ({:6.2}/sec), count: {:8}, sum: {:5.1}sec, \
             p50: {:8.2}ms, p90: {:8.2}ms, p99: {:8.2}ms",
            self.min,
            1e3 / self.min,
            self.mean,
            1e3 / self.mean,
            self.max,
            1e3 / self.max,
            self.count,
            self.sum / 1e3,
            self.quantile(0.5),
            self.quantile(0.9),
            self.quantile(0.99),
        )
    }
}

impl fmt::Debug for StatGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatGroup")
            .field("count", &self.count)
            .field("sum", &self.sum)
            .field("mean", &self.mean)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

/// Settings of a [`StatsAggregator`].
#[derive(Clone, Debug)]
pub struct StatsSettings {
    /// Number of rollup samples to discard before aggregating.
    pub burn_in: u64,
    /// Write a periodic snapshot every this many aggregated rollup samples, `0` for never.
    pub print_interval: u64,
    /// Worker count, for snapshot headers.
    pub workers: usize,
    /// Label of the global group.
    pub global_label: &'static str,
    /// Plural noun for one operation in snapshot headers, e.g. `queries`.
    pub unit: &'static str,
}

/// What an aggregator run produced.
#[derive(Clone, Debug)]
pub struct Summary {
    /// Number of aggregated rollup samples.
    pub aggregated: u64,
    /// The global group, if anything was aggregated.
    pub global: Option<StatGroup>,
}

/// Single-owner, label-keyed statistics map.
#[derive(Debug)]
pub struct StatsAggregator {
    settings: StatsSettings,
    groups: BTreeMap<String, StatGroup>,
    seen: u64,
    aggregated: u64,
}

impl StatsAggregator {
    /// Creates an empty aggregator.
    pub fn new(settings: StatsSettings) -> Self {
        Self {
            settings,
            groups: BTreeMap::new(),
            seen: 0,
            aggregated: 0,
        }
    }

    /// Folds one sample in, writing a periodic snapshot to `periodic` when one is due.
    pub fn push(&mut self, stat: &Stat, periodic: &mut dyn Write) -> io::Result<()> {
        if self.seen < self.settings.burn_in {
            if stat.is_actual {
                self.seen += 1;
                if self.seen == self.settings.burn_in {
                    tracing::info!(
                        "burn-in complete after {} {} with {} workers",
                        self.seen,
                        self.settings.unit,
                        self.settings.workers,
                    );
                }
            }
            return Ok(());
        }

        match self.groups.get_mut(&stat.label) {
            Some(group) => group.push(stat.value),
            None => self
                .groups
                .entry(stat.label.clone())
                .or_default()
                .push(stat.value),
        }

        if stat.is_actual {
            self.groups
                .entry(self.settings.global_label.to_owned())
                .or_default()
                .push(stat.value);
            self.aggregated += 1;

            let interval = self.settings.print_interval;
            if interval > 0 && self.aggregated % interval == 0 {
                writeln!(
                    periodic,
                    "after {} {} with {} workers:",
                    self.aggregated, self.settings.unit, self.settings.workers
                )?;
                self.write_snapshot(periodic)?;
                writeln!(periodic)?;
            }
        }

        Ok(())
    }

    /// Returns the group for `label`, if any sample was aggregated under it.
    pub fn group(&self, label: &str) -> Option<&StatGroup> {
        self.groups.get(label)
    }

    /// Returns the global group.
    pub fn global(&self) -> Option<&StatGroup> {
        self.group(self.settings.global_label)
    }

    /// Number of aggregated rollup samples.
    pub fn aggregated(&self) -> u64 {
        self.aggregated
    }

    /// Writes one line per group, sorted by label.
    pub fn write_snapshot(&self, w: &mut dyn Write) -> io::Result<()> {
        let width = self.groups.keys().map(|label| label.len()).max().unwrap_or(0);
        for (label, group) in &self.groups {
            group.write_line(w, label, width)?;
        }
        Ok(())
    }

    /// Writes the final snapshot.
    pub fn write_final(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(
            w,
            "run complete after {} {} with {} workers:",
            self.aggregated, self.settings.unit, self.settings.workers
        )?;
        self.write_snapshot(w)?;
        w.flush()
    }

    /// Consumes samples until every sender is gone and returns the aggregator.
    ///
    /// Consumed samples are returned to `pool`. The final snapshot is left to the caller, which
    /// only writes it for a run that succeeded.
    pub async fn run<P>(
        mut self,
        mut stats: mpsc::Receiver<Stat>,
        pool: Arc<Pool<Stat>>,
        mut periodic: P,
    ) -> Result<Self>
    where
        P: Write,
    {
        while let Some(stat) = stats.recv().await {
            self.push(&stat, &mut periodic)?;
            pool.put(stat);
        }

        periodic.flush()?;
        Ok(self)
    }

    /// What was aggregated so far.
    pub fn summary(&self) -> Summary {
        Summary {
            aggregated: self.aggregated,
            global: self.global().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(burn_in: u64, print_interval: u64) -> StatsSettings {
        StatsSettings {
            burn_in,
            print_interval,
            workers: 2,
            global_label: ALL_QUERIES,
            unit: "queries",
        }
    }

    fn stat(label: &str, value: f64, is_actual: bool) -> Stat {
        let mut stat = Stat::default();
        stat.set(label, value, is_actual);
        stat
    }

    #[test]
    fn group_summary() {
        let mut group = StatGroup::default();
        for value in [5.0, 10.0, 15.0] {
            group.push(value);
        }

        assert_eq!(group.min(), 5.0);
        assert_eq!(group.max(), 15.0);
        assert_eq!(group.mean(), 10.0);
        assert_eq!(group.count(), 3);
        assert_eq!(group.sum(), 30.0);
        assert!((group.quantile(0.5) - 10.0).abs() < 0.5);
    }

    #[test]
    fn burn_in_discards_leading_rollups() {
        let mut aggregator = StatsAggregator::new(settings(5, 0));
        let mut sink = Vec::new();
        for i in 1..=10 {
            aggregator.push(&stat("q", i as f64, true), &mut sink).unwrap();
        }

        let global = aggregator.global().unwrap();
        assert_eq!(global.count(), 5);
        assert_eq!(global.min(), 6.0);
        assert_eq!(global.sum(), 40.0);
        assert_eq!(aggregator.group("q").unwrap().count(), 5);
        assert!(sink.is_empty());
    }

    #[test]
    fn burn_in_drops_whole_units() {
        let mut aggregator = StatsAggregator::new(settings(1, 0));
        let mut sink = Vec::new();
        for (label, value, is_actual) in [
            ("q-select", 1.0, false),
            ("q", 2.0, true),
            ("q-select", 3.0, false),
            ("q", 4.0, true),
        ] {
            aggregator.push(&stat(label, value, is_actual), &mut sink).unwrap();
        }

        assert_eq!(aggregator.group("q-select").unwrap().count(), 1);
        assert_eq!(aggregator.group("q-select").unwrap().sum(), 3.0);
        assert_eq!(aggregator.group("q").unwrap().sum(), 4.0);
        assert_eq!(aggregator.aggregated(), 1);
    }

    #[test]
    fn phases_stay_out_of_the_global_group() {
        let mut aggregator = StatsAggregator::new(settings(0, 0));
        let mut sink = Vec::new();
        aggregator.push(&stat("q-scan", 1.0, false), &mut sink).unwrap();
        aggregator.push(&stat("q", 2.0, true), &mut sink).unwrap();

        assert_eq!(aggregator.global().unwrap().count(), 1);
        assert_eq!(aggregator.group("q-scan").unwrap().count(), 1);
    }

    #[test]
    fn periodic_and_final_snapshots() {
        let mut aggregator = StatsAggregator::new(settings(0, 2));
        let mut periodic = Vec::new();
        for value in [1.0, 2.0, 4.0] {
            aggregator.push(&stat("ab", value, true), &mut periodic).unwrap();
        }

        let periodic = String::from_utf8(periodic).unwrap();
        assert!(periodic.starts_with("after 2 queries with 2 workers:\n"));
        assert_eq!(periodic.matches("after ").count(), 1);

        let mut primary = Vec::new();
        aggregator.write_final(&mut primary).unwrap();
        let primary = String::from_utf8(primary).unwrap();
        let lines: Vec<_> = primary.lines().collect();
        assert_eq!(lines[0], "run complete after 3 queries with 2 workers:");
        assert!(lines[1].starts_with("ab          : min:     1.00ms (1000.00/sec), "));
        assert!(lines[2].starts_with("all queries : min:     1.00ms (1000.00/sec), "));
        assert!(lines[2].contains("max:    4.00ms (250.00/sec), count:        3, sum:   0.0sec"));
    }

    #[tokio::test]
    async fn run_consumes_until_closed() {
        let pool = Pool::<Stat>::shared();
        let (tx, rx) = mpsc::channel(4);
        let aggregator = StatsAggregator::new(settings(0, 0));
        let task = tokio::spawn(aggregator.run(rx, pool.clone(), io::sink()));

        for value in [5.0, 10.0, 15.0] {
            tx.send(stat("q", value, true)).await.unwrap();
        }
        drop(tx);

        let summary = task.await.unwrap().unwrap().summary();
        assert_eq!(summary.aggregated, 3);
        assert_eq!(summary.global.unwrap().mean(), 10.0);
        assert_eq!(pool.idle(), 3);
    }
}
