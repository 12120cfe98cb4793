//! Step-bucketed aggregation over ordered samples.

use std::str::FromStr;

use super::common::TargetError;

/// An aggregation function applied per step bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Largest value.
    Max,
    /// Smallest value.
    Min,
    /// Arithmetic mean.
    Avg,
    /// Sum of all values.
    Sum,
    /// Number of samples.
    Count,
    /// Value of the latest sample.
    Last,
}

impl Aggregation {
    fn start(self, value: f64) -> Accumulator {
        Accumulator {
            kind: self,
            value,
            count: 1,
        }
    }
}

impl FromStr for Aggregation {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "max" => Self::Max,
            "min" => Self::Min,
            "avg" | "mean" => Self::Avg,
            "sum" => Self::Sum,
            "count" => Self::Count,
            "last" => Self::Last,
            other => return Err(TargetError::UnsupportedAggregation(other.to_owned())),
        })
    }
}

#[derive(Debug)]
struct Accumulator {
    kind: Aggregation,
    value: f64,
    count: u64,
}

impl Accumulator {
    fn push(&mut self, value: f64) {
        self.count += 1;
        match self.kind {
            Aggregation::Max => self.value = self.value.max(value),
            Aggregation::Min => self.value = self.value.min(value),
            Aggregation::Avg | Aggregation::Sum => self.value += value,
            Aggregation::Count => {}
            Aggregation::Last => self.value = value,
        }
    }

    fn finish(&self) -> f64 {
        match self.kind {
            Aggregation::Avg => self.value / self.count as f64,
            Aggregation::Count => self.count as f64,
            _ => self.value,
        }
    }
}

/// Groups timestamp-ordered `(timestamp_ms, value)` samples into buckets of `step_millis`
/// aligned to `origin_millis` and yields one aggregated sample per non-empty bucket.
///
/// A step of zero puts every sample into a single bucket at the origin.
#[derive(Debug)]
pub struct StepAggregator<I> {
    samples: I,
    aggregation: Aggregation,
    origin: i64,
    step: i64,
    pending: Option<(i64, f64)>,
}

impl<I> StepAggregator<I>
where
    I: Iterator<Item = (i64, f64)>,
{
    /// Creates an aggregator over `samples`.
    pub fn new(samples: I, aggregation: Aggregation, origin_millis: i64, step_millis: i64) -> Self {
        Self {
            samples,
            aggregation,
            origin: origin_millis,
            step: step_millis,
            pending: None,
        }
    }

}

/// Start of the step bucket containing `timestamp`. A non-positive step is a single bucket.
fn bucket(origin: i64, step: i64, timestamp: i64) -> i64 {
    if step <= 0 {
        return origin;
    }
    origin + (timestamp - origin).div_euclid(step) * step
}

impl<I> Iterator for StepAggregator<I>
where
    I: Iterator<Item = (i64, f64)>,
{
    type Item = (i64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        let (first_ts, first_value) = self.pending.take().or_else(|| self.samples.next())?;
        let (origin, step) = (self.origin, self.step);
        let current = bucket(origin, step, first_ts);
        let mut acc = self.aggregation.start(first_value);

        for (ts, value) in self.samples.by_ref() {
            if bucket(origin, step, ts) != current {
                self.pending = Some((ts, value));
                break;
            }
            acc.push(value);
        }

        Some((current, acc.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<(i64, f64)> {
        vec![(0, 1.0), (10, 5.0), (59, 3.0), (60, 2.0), (130, 8.0), (170, 4.0)]
    }

    #[test]
    fn buckets_by_step() {
        let max: Vec<_> = StepAggregator::new(samples().into_iter(), Aggregation::Max, 0, 60).collect();
        assert_eq!(max, vec![(0, 5.0), (60, 2.0), (120, 8.0)]);

        let avg: Vec<_> = StepAggregator::new(samples().into_iter(), Aggregation::Avg, 0, 60).collect();
        assert_eq!(avg, vec![(0, 3.0), (60, 2.0), (120, 6.0)]);

        let count: Vec<_> =
            StepAggregator::new(samples().into_iter(), Aggregation::Count, 0, 60).collect();
        assert_eq!(count, vec![(0, 3.0), (60, 1.0), (120, 2.0)]);
    }

    #[test]
    fn zero_step_is_one_bucket() {
        let sum: Vec<_> = StepAggregator::new(samples().into_iter(), Aggregation::Sum, 0, 0).collect();
        assert_eq!(sum, vec![(0, 23.0)]);

        let last: Vec<_> = StepAggregator::new(samples().into_iter(), Aggregation::Last, 0, 0).collect();
        assert_eq!(last, vec![(0, 4.0)]);
    }

    #[test]
    fn stream_of_buckets_is_resumable() {
        let mut buckets = StepAggregator::new(samples().into_iter(), Aggregation::Max, 0, 60);
        assert_eq!(buckets.next(), Some((0, 5.0)));
        assert_eq!(buckets.next(), Some((60, 2.0)));
        assert_eq!(buckets.next(), Some((120, 8.0)));
        assert_eq!(buckets.next(), None);
        assert_eq!(bucket(0, 60, -1), -60);
    }

    #[test]
    fn buckets_align_to_origin() {
        let min: Vec<_> = StepAggregator::new(samples().into_iter(), Aggregation::Min, 10, 60).collect();
        assert_eq!(min, vec![(-50, 1.0), (10, 2.0), (130, 4.0)]);
    }

    #[test]
    fn unknown_aggregation_is_rejected() {
        assert_eq!("avg".parse::<Aggregation>().unwrap(), Aggregation::Avg);
        assert!(matches!(
            "median".parse::<Aggregation>(),
            Err(TargetError::UnsupportedAggregation(name)) if name == "median"
        ));
    }
}
