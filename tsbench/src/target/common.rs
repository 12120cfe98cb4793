use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use futures::stream::BoxStream;
use thiserror::Error;

/// Label carrying the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A type-erased [`Appender`] instance.
pub type BoxedAppender = Box<dyn Appender>;

/// A type-erased [`Querier`] instance.
pub type BoxedQuerier = Box<dyn Querier>;

/// Lazily produced `(timestamp_ms, value)` samples of one series.
pub type SampleStream = BoxStream<'static, TargetResult<(i64, f64)>>;

/// Lazily produced series of a query result.
pub type SeriesStream = BoxStream<'static, TargetResult<Series>>;

/// Write capability of a target system.
///
/// Every worker owns its own appender; implementations do not need to be shareable.
#[async_trait::async_trait]
pub trait Appender: Debug + Send + 'static {
    /// Appends one sample to the series identified by `labels`, returning a target-specific
    /// reference for it.
    async fn add(&mut self, labels: &Labels, timestamp_nanos: i64, value: f64) -> TargetResult<u64>;

    /// Waits until everything added so far has been committed, or `deadline` elapses.
    async fn await_completion(&mut self, deadline: Duration) -> TargetResult<()>;
}

/// Read capability of a target system.
#[async_trait::async_trait]
pub trait Querier: Debug + Send + 'static {
    /// Runs a selection. Producing the series and their samples is lazy: the cost of a query
    /// includes consuming the returned stream.
    async fn select(&mut self, selection: &Selection<'_>) -> TargetResult<SeriesStream>;
}

/// Parameters of a [`Querier::select`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Selection<'a> {
    /// Metric name to select, matched against the [`METRIC_NAME_LABEL`] label.
    pub metric: &'a str,
    /// Aggregation to apply per step, empty for raw samples.
    pub aggregation: &'a str,
    /// Step width in milliseconds, `0` for one bucket over the whole range.
    pub step_millis: i64,
    /// Filter expression, empty for none.
    pub filter: &'a str,
    /// Inclusive start of the range, in milliseconds since the epoch.
    pub start_millis: i64,
    /// Exclusive end of the range, in milliseconds since the epoch.
    pub end_millis: i64,
}

/// One series of a query result.
pub struct Series {
    /// Labels identifying the series.
    pub labels: Labels,
    /// The series' samples.
    pub samples: SampleStream,
}

impl Debug for Series {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Series")
            .field("labels", &self.labels)
            .finish_non_exhaustive()
    }
}

/// An ordered set of label pairs identifying a series.
///
/// Cleared label sets keep their string buffers, so decoding into a recycled set does not
/// allocate once the buffers have grown.
#[derive(Default)]
pub struct Labels {
    pairs: Vec<(String, String)>,
    len: usize,
}

impl Labels {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sorted label set from pairs.
    pub fn from_pairs<K: AsRef<str>, V: AsRef<str>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut labels = Self::new();
        for (key, value) in pairs {
            labels.push(key.as_ref(), value.as_ref());
        }
        labels.sort();
        labels
    }

    /// Appends a pair. Call [`sort`](Self::sort) once all pairs are in.
    pub fn push(&mut self, key: &str, value: &str) {
        if let Some((k, v)) = self.pairs.get_mut(self.len) {
            k.clear();
            k.push_str(key);
            v.clear();
            v.push_str(value);
        } else {
            self.pairs.push((key.to_owned(), value.to_owned()));
        }
        self.len += 1;
    }

    /// Sorts the pairs by key, then value.
    pub fn sort(&mut self) {
        self.pairs[..self.len].sort_unstable();
    }

    /// Removes all pairs, keeping their buffers for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns the value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    /// Returns the metric name of the series.
    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Iterates over the pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.as_slice().iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A hash of the label set that is stable for the lifetime of the process.
    pub fn series_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn as_slice(&self) -> &[(String, String)] {
        &self.pairs[..self.len]
    }
}

impl Clone for Labels {
    fn clone(&self) -> Self {
        Self {
            pairs: self.as_slice().to_vec(),
            len: self.len,
        }
    }
}

impl PartialEq for Labels {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Labels {}

impl PartialOrd for Labels {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Labels {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl Hash for Labels {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl Debug for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// Errors reported by target systems.
#[derive(Debug, Error)]
pub enum TargetError {
    /// IO errors while encoding or sending a request.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The target answered, but refused the request.
    #[error("request rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code of the response.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// All errors stemming from the reqwest client, such as connection failures.
    #[error("reqwest error: {context}")]
    Reqwest {
        /// What was being attempted.
        context: String,
        /// The underlying client error.
        #[source]
        cause: reqwest::Error,
    },

    /// Pending writes were not committed before the deadline.
    #[error("timed out after {0:?} waiting for completion")]
    Timeout(Duration),

    /// The filter expression could not be parsed.
    #[error("invalid filter expression `{0}`")]
    InvalidFilter(String),

    /// The target does not implement the requested aggregation.
    #[error("unsupported aggregation `{0}`")]
    UnsupportedAggregation(String),
}

/// Result type for target operations.
pub type TargetResult<T> = Result<T, TargetError>;
