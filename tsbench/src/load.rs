//! The write path: decoding pipe-format lines and appending them to a target.
//!
//! Every input line carries one sample:
//!
//! ```text
//! <metric>#<key> <value> <key> <value> ...#<value>#<timestamp_ms>
//! ```
//!
//! The label block becomes the series' label set, extended with the metric name under
//! [`METRIC_NAME_LABEL`]. Empty lines are skipped, and so are dataset size markers, which are
//! only logged.

use std::io::BufRead;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::data_gen::DevopsSimulator;
use crate::error::{Error, Result};
use crate::executor::{Decoder, Handler, Phases, WorkItem};
use crate::point::{FieldValue, Point};
use crate::pool::Recycle;
use crate::serializer::{DATASET_SIZE_MARKER, parse_size_marker};
use crate::target::in_memory::InMemoryTsdb;
use crate::target::{BoxedAppender, Labels, METRIC_NAME_LABEL};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Default time workers wait for their appender to commit pending writes.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(5);

/// One sample to append.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteItem {
    /// Metric name, also the stat label of the write.
    pub metric: String,
    /// Sorted labels of the series, including the metric name.
    pub labels: Labels,
    /// Timestamp in nanoseconds since the epoch.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

impl Recycle for WriteItem {
    fn recycle(&mut self) {
        self.metric.clear();
        self.labels.clear();
        self.timestamp = 0;
        self.value = 0.0;
    }
}

impl WorkItem for WriteItem {
    fn label(&self) -> &str {
        &self.metric
    }

    fn series_hash(&self) -> u64 {
        self.labels.series_hash()
    }
}

/// Parses one pipe-format line into `item`.
///
/// `line` must not contain the line terminator.
pub fn parse_line(line: &str, line_number: u64, item: &mut WriteItem) -> Result<()> {
    let malformed = |reason: String| Error::Malformed {
        line: line_number,
        reason,
    };

    let mut parts = line.split('#');
    let (Some(metric), Some(labels), Some(value), Some(timestamp), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(malformed(format!(
            "expected 4 `#`-separated parts, got {}",
            line.split('#').count()
        )));
    };

    if metric.is_empty() {
        return Err(malformed("empty metric name".to_owned()));
    }

    let mut tokens = labels.split(' ').filter(|token| !token.is_empty());
    while let Some(key) = tokens.next() {
        let Some(label_value) = tokens.next() else {
            return Err(malformed(format!("label `{key}` has no value")));
        };
        item.labels.push(key, label_value);
    }
    item.labels.push(METRIC_NAME_LABEL, metric);
    item.labels.sort();

    item.metric.push_str(metric);
    item.value = value
        .parse()
        .map_err(|_| malformed(format!("invalid value `{value}`")))?;
    let millis: i64 = timestamp
        .parse()
        .map_err(|_| malformed(format!("invalid timestamp `{timestamp}`")))?;
    item.timestamp = millis
        .checked_mul(NANOS_PER_MILLI)
        .ok_or_else(|| malformed(format!("timestamp `{timestamp}` out of range")))?;

    Ok(())
}

/// Reads [`WriteItem`]s from pipe-format lines.
#[derive(Debug)]
pub struct LineDecoder<R> {
    reader: R,
    line: String,
    line_number: u64,
    bytes_read: Arc<AtomicU64>,
}

impl<R: BufRead> LineDecoder<R> {
    /// Creates a decoder reading from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_number: 0,
            bytes_read: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A counter of the input bytes consumed so far, usable after the decoder moved on.
    pub fn bytes_read(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.bytes_read)
    }

    fn read_into(&mut self, item: &mut WriteItem) -> Result<bool> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(false);
            }
            self.line_number += 1;
            self.bytes_read.fetch_add(read as u64, Ordering::Relaxed);

            let line = self.line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            if line.starts_with(DATASET_SIZE_MARKER) {
                match parse_size_marker(line) {
                    Some((points, values)) => tracing::info!(points, values, "dataset size"),
                    None => tracing::warn!(line = self.line_number, "ignoring invalid size marker"),
                }
                continue;
            }

            parse_line(line, self.line_number, item)?;
            return Ok(true);
        }
    }
}

impl<R> Decoder for LineDecoder<R>
where
    R: BufRead + Send + 'static,
{
    type Item = WriteItem;

    fn decode_next(&mut self, item: &mut WriteItem) -> Result<bool> {
        self.read_into(item)
    }
}

/// Appends every item to the worker's appender.
#[derive(Debug)]
pub struct WriteHandler {
    appender: BoxedAppender,
    completion_timeout: Duration,
}

impl WriteHandler {
    /// Creates a handler that waits up to `completion_timeout` for pending writes at the end.
    pub fn new(appender: BoxedAppender, completion_timeout: Duration) -> Self {
        Self {
            appender,
            completion_timeout,
        }
    }
}

#[async_trait::async_trait]
impl Handler for WriteHandler {
    type Item = WriteItem;

    async fn handle(&mut self, item: &WriteItem, _phases: &mut Phases) -> Result<()> {
        self.appender
            .add(&item.labels, item.timestamp, item.value)
            .await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.appender
            .await_completion(self.completion_timeout)
            .await?;
        Ok(())
    }
}

/// Fills `db` with every point of `simulator`, one series per point field.
///
/// Series get the same labels the loader derives from the pipe format. Returns the number of
/// samples inserted.
pub fn preload(db: &InMemoryTsdb, mut simulator: DevopsSimulator) -> u64 {
    let mut point = Point::default();
    let mut labels = Labels::new();
    let mut metric = String::new();
    let mut samples = 0;

    while simulator.next_point(&mut point) {
        for (field, value) in &point.fields {
            let value = match value {
                FieldValue::Int(v) => *v as f64,
                FieldValue::Float(v) => *v,
                FieldValue::Float32(v) => f64::from(*v),
                FieldValue::Bool(v) => f64::from(u8::from(*v)),
                FieldValue::Bytes(_) | FieldValue::Str(_) => continue,
            };

            metric.clear();
            metric.push_str(&point.measurement);
            metric.push('_');
            metric.push_str(field);

            labels.clear();
            labels.push("measurement", &point.measurement);
            for (key, tag) in &point.tags {
                labels.push(key, tag);
            }
            labels.push(METRIC_NAME_LABEL, &metric);
            labels.sort();

            db.insert(&labels, point.timestamp, value);
            samples += 1;
        }
        point.recycle();
    }

    tracing::debug!(samples, series = db.series_count(), "preloaded in-memory target");
    samples
}
