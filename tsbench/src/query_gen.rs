//! Randomized devops query generation.
//!
//! A [`QueryGenerator`] owns a set of [`QueryShape`]s and fills pooled [`Query`] objects with
//! concrete instances of them: a random window inside the configured time range and, for
//! host-filtered shapes, a random set of distinct hosts. Labels only depend on the shape, so
//! latency statistics of one shape always land in the same bucket.

use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand_distr::Distribution;
use rand_distr::weighted::WeightedIndex;

use crate::error::{Error, Result};
use crate::interval::TimeInterval;
use crate::query::Query;

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);
const MINUTE_MILLIS: i64 = 60_000;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;

/// Formats a duration as `1h0m0s`, `1m30s`, `1.5s` or `250ms`.
///
/// Hours and minutes are written from the largest non-zero unit down, and fractional seconds
/// drop trailing zeros. Stat labels use this rendering and must not change.
#[derive(Clone, Copy, Debug)]
struct WindowLabel(Duration);

impl fmt::Display for WindowLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nanos = self.0.as_nanos();
        if nanos == 0 {
            return f.write_str("0s");
        }
        if nanos < 1_000 {
            return write!(f, "{nanos}ns");
        }
        if nanos < 1_000_000 {
            write_fraction(f, nanos, 1_000)?;
            return f.write_str("µs");
        }
        if nanos < 1_000_000_000 {
            write_fraction(f, nanos, 1_000_000)?;
            return f.write_str("ms");
        }

        let secs = self.0.as_secs();
        let (hours, minutes) = (secs / 3600, secs % 3600 / 60);
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if hours > 0 || minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        let nanos = u128::from(secs % 60) * 1_000_000_000 + u128::from(self.0.subsec_nanos());
        write_fraction(f, nanos, 1_000_000_000)?;
        f.write_str("s")
    }
}

fn write_fraction(f: &mut fmt::Formatter<'_>, value: u128, unit: u128) -> fmt::Result {
    write!(f, "{}", value / unit)?;
    let rest = value % unit;
    if rest == 0 {
        return Ok(());
    }
    let width = unit.ilog10() as usize;
    let digits = format!("{rest:0width$}");
    write!(f, ".{}", digits.trim_end_matches('0'))
}

/// Metric every devops query targets.
pub const CPU_METRIC: &str = "cpu_usage_user";

/// One kind of devops query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryShape {
    /// Maximum cpu per minute over `hosts` random hosts and a random `window`.
    MaxCpuNHosts {
        /// Number of distinct hosts in the filter.
        hosts: usize,
        /// Length of the queried window.
        window: Duration,
    },
    /// Mean cpu per hour and host over all hosts and a random day.
    MeanCpuGroupByHost,
}

impl QueryShape {
    /// Number of distinct hosts the shape selects.
    pub fn hosts(&self) -> usize {
        match self {
            Self::MaxCpuNHosts { hosts, .. } => *hosts,
            Self::MeanCpuGroupByHost => 0,
        }
    }

    /// The stat label of queries of this shape.
    pub fn label(&self) -> String {
        match self {
            Self::MaxCpuNHosts { hosts, window } => format!(
                "tsdb max cpu, rand {hosts:4} hosts, rand {} by 1m",
                WindowLabel(*window)
            ),
            Self::MeanCpuGroupByHost => "tsdb mean cpu, all hosts, rand 1day by 1hour".to_owned(),
        }
    }

    fn window(&self) -> Duration {
        match self {
            Self::MaxCpuNHosts { window, .. } => *window,
            Self::MeanCpuGroupByHost => DAY,
        }
    }
}

/// Named query mixes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryType {
    /// Max cpu of one host over an hour.
    OneHostOneHour,
    /// Max cpu of two hosts over an hour.
    TwoHostsOneHour,
    /// Max cpu of four hosts over an hour.
    FourHostsOneHour,
    /// Max cpu of eight hosts over an hour.
    EightHostsOneHour,
    /// Max cpu of sixteen hosts over an hour.
    SixteenHostsOneHour,
    /// Max cpu of thirty-two hosts over an hour.
    ThirtyTwoHostsOneHour,
    /// Max cpu of one host over twelve hours.
    OneHostTwelveHours,
    /// Mean cpu of all hosts grouped by host.
    GroupBy,
    /// All of the above, round robin.
    All,
}

impl QueryType {
    /// The shapes this query type dispatches over.
    pub fn shapes(self) -> Vec<QueryShape> {
        let n_hosts = |hosts, window| QueryShape::MaxCpuNHosts { hosts, window };
        match self {
            Self::OneHostOneHour => vec![n_hosts(1, HOUR)],
            Self::TwoHostsOneHour => vec![n_hosts(2, HOUR)],
            Self::FourHostsOneHour => vec![n_hosts(4, HOUR)],
            Self::EightHostsOneHour => vec![n_hosts(8, HOUR)],
            Self::SixteenHostsOneHour => vec![n_hosts(16, HOUR)],
            Self::ThirtyTwoHostsOneHour => vec![n_hosts(32, HOUR)],
            Self::OneHostTwelveHours => vec![n_hosts(1, 12 * HOUR)],
            Self::GroupBy => vec![QueryShape::MeanCpuGroupByHost],
            Self::All => vec![
                n_hosts(1, HOUR),
                n_hosts(2, HOUR),
                n_hosts(4, HOUR),
                n_hosts(8, HOUR),
                n_hosts(16, HOUR),
                n_hosts(32, HOUR),
                n_hosts(1, 12 * HOUR),
                QueryShape::MeanCpuGroupByHost,
            ],
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::OneHostOneHour => "1-host-1-hr",
            Self::TwoHostsOneHour => "2-host-1-hr",
            Self::FourHostsOneHour => "4-host-1-hr",
            Self::EightHostsOneHour => "8-host-1-hr",
            Self::SixteenHostsOneHour => "16-host-1-hr",
            Self::ThirtyTwoHostsOneHour => "32-host-1-hr",
            Self::OneHostTwelveHours => "1-host-12-hr",
            Self::GroupBy => "groupby",
            Self::All => "all",
        }
    }
}

impl FromStr for QueryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "1-host-1-hr" => Self::OneHostOneHour,
            "2-host-1-hr" => Self::TwoHostsOneHour,
            "4-host-1-hr" => Self::FourHostsOneHour,
            "8-host-1-hr" => Self::EightHostsOneHour,
            "16-host-1-hr" => Self::SixteenHostsOneHour,
            "32-host-1-hr" => Self::ThirtyTwoHostsOneHour,
            "1-host-12-hr" => Self::OneHostTwelveHours,
            "groupby" => Self::GroupBy,
            "all" => Self::All,
            other => return Err(format!("unknown query type `{other}`")),
        })
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How the generator picks the shape of the next query.
#[derive(Clone, Debug)]
pub enum ShapeSelector {
    /// Query `i` uses shape `i mod n`.
    RoundRobin,
    /// Shapes are drawn at random with the given relative weights.
    Weighted(Vec<u32>),
}

#[derive(Debug)]
enum Selector {
    RoundRobin,
    Weighted(WeightedIndex<u32>),
}

/// A builder for a [`QueryGenerator`].
#[derive(Debug)]
pub struct QueryGeneratorBuilder {
    interval: TimeInterval,
    scale_var: usize,
    shapes: Vec<QueryShape>,
    selector: ShapeSelector,
    seed: Option<u64>,
}

impl QueryGeneratorBuilder {
    /// Number of hosts in the simulated fleet.
    pub fn scale_var(mut self, scale_var: usize) -> Self {
        self.scale_var = scale_var;
        self
    }

    /// Shapes to generate.
    pub fn shapes(mut self, shapes: Vec<QueryShape>) -> Self {
        self.shapes = shapes;
        self
    }

    /// Shapes of a named query type.
    pub fn query_type(self, query_type: QueryType) -> Self {
        self.shapes(query_type.shapes())
    }

    /// How shapes are picked.
    pub fn selector(mut self, selector: ShapeSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Seeds the random source, or draws from entropy for `None`.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the shapes and creates the generator.
    pub fn build(self) -> Result<QueryGenerator> {
        if self.shapes.is_empty() {
            return Err(Error::Config("at least one query shape is required".to_owned()));
        }
        for shape in &self.shapes {
            check_hosts(shape, self.scale_var)?;
            let window = shape.window();
            if window > self.interval.duration() {
                return Err(Error::WindowTooLarge {
                    window,
                    span: self.interval.duration(),
                });
            }
        }

        let selector = match self.selector {
            ShapeSelector::RoundRobin => Selector::RoundRobin,
            ShapeSelector::Weighted(weights) => {
                if weights.len() != self.shapes.len() {
                    return Err(Error::Config(format!(
                        "{} weights given for {} query shapes",
                        weights.len(),
                        self.shapes.len()
                    )));
                }
                let index = WeightedIndex::new(weights)
                    .map_err(|e| Error::Config(format!("invalid shape weights: {e}")))?;
                Selector::Weighted(index)
            }
        };

        Ok(QueryGenerator {
            interval: self.interval,
            scale_var: self.scale_var,
            labels: self.shapes.iter().map(QueryShape::label).collect(),
            shapes: self.shapes,
            selector,
            rng: crate::seeded_rng(self.seed),
            hosts: (0..self.scale_var).collect(),
        })
    }
}

fn check_hosts(shape: &QueryShape, scale_var: usize) -> Result<()> {
    let requested = shape.hosts();
    if requested > scale_var {
        return Err(Error::TooManyHosts {
            requested,
            scale_var,
        });
    }
    Ok(())
}

/// Fills queries with random instances of a set of shapes.
#[derive(Debug)]
pub struct QueryGenerator {
    interval: TimeInterval,
    scale_var: usize,
    shapes: Vec<QueryShape>,
    labels: Vec<String>,
    selector: Selector,
    rng: SmallRng,
    hosts: Vec<usize>,
}

impl QueryGenerator {
    /// Constructs a builder for queries over `interval`.
    pub fn builder(interval: TimeInterval) -> QueryGeneratorBuilder {
        QueryGeneratorBuilder {
            interval,
            scale_var: crate::data_gen::DEFAULT_SCALE_VAR,
            shapes: QueryType::OneHostOneHour.shapes(),
            selector: ShapeSelector::RoundRobin,
            seed: Some(crate::DEFAULT_SEED),
        }
    }

    /// Fills `query` with the `i`-th query. `query` must be empty, e.g. freshly taken from a
    /// pool.
    pub fn dispatch(&mut self, i: u64, query: &mut Query) -> Result<()> {
        let index = match &self.selector {
            Selector::RoundRobin => (i % self.shapes.len() as u64) as usize,
            Selector::Weighted(weights) => weights.sample(&mut self.rng),
        };
        let shape = self.shapes[index];
        check_hosts(&shape, self.scale_var)?;

        let window = self.interval.rand_window(shape.window(), &mut self.rng)?;
        let label = &self.labels[index];

        query.human_label.push_str(label);
        // Writing into a `String` cannot fail.
        let _ = write!(query.human_description, "{label}: {}", window.start_string());
        query.metric_name.push_str(CPU_METRIC);
        query.time_start = window.start_millis();
        query.time_end = window.end_millis();

        match shape {
            QueryShape::MaxCpuNHosts { hosts, .. } => {
                query.aggregation_type.push_str("max");
                query.step = MINUTE_MILLIS;

                let (chosen, _) = self.hosts.partial_shuffle(&mut self.rng, hosts);
                for (n, host) in chosen.iter().enumerate() {
                    if n > 0 {
                        query.filter.push_str(" and ");
                    }
                    let _ = write!(query.filter, "hostname=='host_{host}'");
                }
            }
            QueryShape::MeanCpuGroupByHost => {
                query.aggregation_type.push_str("avg");
                query.step = HOUR_MILLIS;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn window_labels() {
        let cases = [
            (Duration::ZERO, "0s"),
            (Duration::from_nanos(1_500), "1.5µs"),
            (Duration::from_millis(250), "250ms"),
            (Duration::from_millis(1_500), "1.5s"),
            (Duration::from_secs(90), "1m30s"),
            (HOUR, "1h0m0s"),
            (12 * HOUR, "12h0m0s"),
            (DAY + Duration::from_secs(61), "24h1m1s"),
        ];
        for (window, expected) in cases {
            assert_eq!(WindowLabel(window).to_string(), expected);
        }
    }

    fn range() -> TimeInterval {
        let start = humantime::parse_rfc3339("2016-01-01T00:00:00Z").unwrap();
        TimeInterval::new(start, start + 3 * DAY).unwrap()
    }

    fn hosts_in(filter: &str) -> Vec<usize> {
        filter
            .split(" and ")
            .map(|term| {
                term.strip_prefix("hostname=='host_")
                    .and_then(|rest| rest.strip_suffix('\''))
                    .unwrap()
                    .parse()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn n_host_filters_have_distinct_hosts() {
        let mut generator = QueryGenerator::builder(range())
            .scale_var(32)
            .query_type(QueryType::All)
            .build()
            .unwrap();

        for i in 0..400 {
            let mut query = Query::default();
            generator.dispatch(i, &mut query).unwrap();
            let shape = QueryType::All.shapes()[(i % 8) as usize];

            if shape.hosts() == 0 {
                assert!(query.filter.is_empty());
                continue;
            }
            let hosts = hosts_in(&query.filter);
            let distinct: BTreeSet<_> = hosts.iter().copied().collect();
            assert_eq!(hosts.len(), shape.hosts());
            assert_eq!(distinct.len(), shape.hosts());
            assert!(hosts.iter().all(|h| *h < 32));
        }
    }

    #[test]
    fn fills_max_cpu_queries() {
        let mut generator = QueryGenerator::builder(range())
            .scale_var(8)
            .query_type(QueryType::EightHostsOneHour)
            .build()
            .unwrap();
        let mut query = Query::default();
        generator.dispatch(0, &mut query).unwrap();

        assert_eq!(query.human_label, "tsdb max cpu, rand    8 hosts, rand 1h0m0s by 1m");
        assert!(query.human_description.starts_with("tsdb max cpu, rand    8 hosts, rand 1h0m0s by 1m: 2016-01-0"));
        assert_eq!(query.metric_name, "cpu_usage_user");
        assert_eq!(query.aggregation_type, "max");
        assert_eq!(query.step, 60_000);
        assert_eq!(query.time_end - query.time_start, 3_600_000);
        assert!(query.time_start >= range().start_millis());
        assert!(query.time_end <= range().end_millis());

        let mut hosts = hosts_in(&query.filter);
        hosts.sort_unstable();
        assert_eq!(hosts, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn fills_group_by_queries() {
        let mut generator = QueryGenerator::builder(range())
            .query_type(QueryType::GroupBy)
            .build()
            .unwrap();
        let mut query = Query::default();
        generator.dispatch(0, &mut query).unwrap();

        assert_eq!(query.human_label, "tsdb mean cpu, all hosts, rand 1day by 1hour");
        assert_eq!(query.aggregation_type, "avg");
        assert_eq!(query.step, 3_600_000);
        assert_eq!(query.time_end - query.time_start, 86_400_000);
        assert!(query.filter.is_empty());
    }

    #[test]
    fn too_many_hosts_fail_fast() {
        let err = QueryGenerator::builder(range())
            .scale_var(4)
            .query_type(QueryType::EightHostsOneHour)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TooManyHosts {
                requested: 8,
                scale_var: 4
            }
        ));
    }

    #[test]
    fn windows_must_fit_the_range() {
        let start = humantime::parse_rfc3339("2016-01-01T00:00:00Z").unwrap();
        let short = TimeInterval::new(start, start + HOUR).unwrap();
        let err = QueryGenerator::builder(short)
            .query_type(QueryType::OneHostTwelveHours)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::WindowTooLarge { .. }));
    }

    #[test]
    fn labels_do_not_depend_on_randomness() {
        let generate = |seed| {
            let mut generator = QueryGenerator::builder(range())
                .scale_var(32)
                .query_type(QueryType::All)
                .seed(seed)
                .build()
                .unwrap();
            (0..16)
                .map(|i| {
                    let mut query = Query::default();
                    generator.dispatch(i, &mut query).unwrap();
                    query
                })
                .collect::<Vec<_>>()
        };

        let a = generate(Some(1));
        let b = generate(Some(2));
        let labels = |queries: &[Query]| queries.iter().map(|q| q.human_label.clone()).collect::<Vec<_>>();
        assert_eq!(labels(&a), labels(&b));
        assert_ne!(a, b);
        assert_eq!(a, generate(Some(1)));
    }

    #[test]
    fn weighted_selection_skips_zero_weights() {
        let mut generator = QueryGenerator::builder(range())
            .scale_var(32)
            .shapes(vec![
                QueryShape::MeanCpuGroupByHost,
                QueryShape::MaxCpuNHosts {
                    hosts: 2,
                    window: HOUR,
                },
            ])
            .selector(ShapeSelector::Weighted(vec![0, 1]))
            .build()
            .unwrap();

        for i in 0..50 {
            let mut query = Query::default();
            generator.dispatch(i, &mut query).unwrap();
            assert_eq!(query.aggregation_type, "max");
        }
    }

    #[test]
    fn mismatched_weights_are_rejected() {
        let result = QueryGenerator::builder(range())
            .selector(ShapeSelector::Weighted(vec![1, 2]))
            .build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn query_type_names() {
        for name in ["1-host-1-hr", "32-host-1-hr", "1-host-12-hr", "groupby", "all"] {
            assert_eq!(name.parse::<QueryType>().unwrap().to_string(), name);
        }
        assert!("3-host-1-hr".parse::<QueryType>().is_err());
    }
}
