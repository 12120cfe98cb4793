//! In-process TSDB target.
//!
//! Series are keyed by their full label set and hold samples ordered by timestamp. The store is
//! [`Clone`] and shared: every worker gets its own [`InMemoryAppender`] or [`InMemoryQuerier`]
//! handle, while tests hold on to the store for direct inspection.
//!
//! Filters use the expression language of generated queries: `key=='value'` terms joined by
//! ` and `. Terms repeating the same key are alternatives, so
//! `hostname=='host_1' and hostname=='host_7'` selects both hosts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;

use super::aggregate::{Aggregation, StepAggregator};
use super::common::{
    Appender, Labels, Querier, SampleStream, Selection, Series, SeriesStream, TargetError,
    TargetResult,
};

const NANOS_PER_MILLI: i64 = 1_000_000;

type Store = HashMap<Labels, BTreeMap<i64, f64>>;

/// Shared in-memory series store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTsdb {
    store: Arc<Mutex<Store>>,
}

impl InMemoryTsdb {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a write handle for one worker.
    pub fn appender(&self) -> InMemoryAppender {
        InMemoryAppender {
            db: self.clone(),
            appended: 0,
        }
    }

    /// Creates a read handle for one worker.
    pub fn querier(&self) -> InMemoryQuerier {
        InMemoryQuerier { db: self.clone() }
    }

    /// Stores one sample, replacing an existing sample at the same timestamp.
    ///
    /// Returns the number of samples held by the series afterwards.
    pub fn insert(&self, labels: &Labels, timestamp_nanos: i64, value: f64) -> u64 {
        let mut store = self.lock();
        if let Some(samples) = store.get_mut(labels) {
            samples.insert(timestamp_nanos, value);
            return samples.len() as u64;
        }
        let samples = store.entry(labels.clone()).or_default();
        samples.insert(timestamp_nanos, value);
        samples.len() as u64
    }

    /// Returns the number of distinct series.
    pub fn series_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns the total number of stored samples.
    pub fn sample_count(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    /// Returns a copy of a series' samples as `(timestamp_nanos, value)`.
    pub fn samples(&self, labels: &Labels) -> Option<Vec<(i64, f64)>> {
        let store = self.lock();
        let samples = store.get(labels)?;
        Some(samples.iter().map(|(ts, v)| (*ts, *v)).collect())
    }

    /// Samples of a series in `[start, end)` nanoseconds, with timestamps in milliseconds.
    fn range(&self, labels: &Labels, start: i64, end: i64) -> Vec<(i64, f64)> {
        let store = self.lock();
        let Some(samples) = store.get(labels) else {
            return Vec::new();
        };
        samples
            .range(start..end)
            .map(|(ts, v)| (ts.div_euclid(NANOS_PER_MILLI), *v))
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-worker write handle of an [`InMemoryTsdb`].
#[derive(Debug)]
pub struct InMemoryAppender {
    db: InMemoryTsdb,
    appended: u64,
}

#[async_trait::async_trait]
impl Appender for InMemoryAppender {
    #[tracing::instrument(level = "trace", skip(self, labels), fields(labels = %labels))]
    async fn add(&mut self, labels: &Labels, timestamp_nanos: i64, value: f64) -> TargetResult<u64> {
        self.appended += 1;
        Ok(self.db.insert(labels, timestamp_nanos, value))
    }

    async fn await_completion(&mut self, _deadline: Duration) -> TargetResult<()> {
        // Inserts are visible immediately.
        tracing::trace!(appended = self.appended, "in-memory appender complete");
        Ok(())
    }
}

/// Per-worker read handle of an [`InMemoryTsdb`].
#[derive(Debug)]
pub struct InMemoryQuerier {
    db: InMemoryTsdb,
}

#[async_trait::async_trait]
impl Querier for InMemoryQuerier {
    #[tracing::instrument(level = "trace", skip_all, fields(metric = selection.metric))]
    async fn select(&mut self, selection: &Selection<'_>) -> TargetResult<SeriesStream> {
        let aggregation = match selection.aggregation {
            "" => None,
            name => Some(name.parse::<Aggregation>()?),
        };
        let filter = Filter::parse(selection.filter)?;
        let start = selection.start_millis.saturating_mul(NANOS_PER_MILLI);
        let end = selection.end_millis.saturating_mul(NANOS_PER_MILLI);

        // The set of series is fixed here. Their samples are read as the stream is polled.
        let mut matched: Vec<Labels> = {
            let store = self.db.lock();
            store
                .keys()
                .filter(|labels| labels.metric_name() == Some(selection.metric))
                .filter(|labels| filter.matches(labels))
                .cloned()
                .collect()
        };
        matched.sort_unstable();
        if end <= start {
            matched.clear();
        }

        let db = self.db.clone();
        let origin = selection.start_millis;
        let step = selection.step_millis;
        let series = futures::stream::iter(matched).filter_map(move |labels| {
            let raw = db.range(&labels, start, end);
            async move {
                if raw.is_empty() {
                    return None;
                }
                let samples: SampleStream = match aggregation {
                    Some(aggregation) => {
                        let buckets =
                            StepAggregator::new(raw.into_iter(), aggregation, origin, step);
                        futures::stream::iter(buckets.map(Ok)).boxed()
                    }
                    None => futures::stream::iter(raw.into_iter().map(Ok)).boxed(),
                };
                Some(Ok(Series { labels, samples }))
            }
        });

        Ok(series.boxed())
    }
}

/// Parsed filter expression: every key must match one of its values.
#[derive(Debug, Default, PartialEq)]
struct Filter<'a> {
    terms: Vec<(&'a str, Vec<&'a str>)>,
}

impl<'a> Filter<'a> {
    fn parse(expression: &'a str) -> TargetResult<Self> {
        let mut filter = Self::default();
        if expression.trim().is_empty() {
            return Ok(filter);
        }

        for term in expression.split(" and ") {
            let invalid = || TargetError::InvalidFilter(expression.to_owned());
            let (key, value) = term.split_once("==").ok_or_else(invalid)?;
            let key = key.trim();
            let value = unquote(value.trim()).ok_or_else(invalid)?;
            if key.is_empty() {
                return Err(invalid());
            }

            match filter.terms.iter_mut().find(|(k, _)| *k == key) {
                Some((_, values)) => values.push(value),
                None => filter.terms.push((key, vec![value])),
            }
        }

        Ok(filter)
    }

    fn matches(&self, labels: &Labels) -> bool {
        self.terms.iter().all(|(key, values)| {
            labels
                .get(key)
                .is_some_and(|actual| values.contains(&actual))
        })
    }
}

fn unquote(value: &str) -> Option<&str> {
    for quote in ['\'', '"'] {
        if let Some(inner) = value.strip_prefix(quote) {
            return inner.strip_suffix(quote);
        }
    }
    Some(value)
}
