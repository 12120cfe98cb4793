//! Bounded time ranges and random sub-window sampling.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::error::{Error, Result};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// An immutable, half-open `[start, end)` time range with nanosecond resolution.
///
/// Bounds are stored as signed nanoseconds since the Unix epoch, which is also the timestamp
/// unit of generated points.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TimeInterval {
    start: i64,
    end: i64,
}

impl TimeInterval {
    /// Creates an interval from two points in time.
    pub fn new(start: SystemTime, end: SystemTime) -> Result<Self> {
        Self::from_nanos(to_nanos(start), to_nanos(end))
    }

    /// Creates an interval from nanosecond epoch bounds.
    pub fn from_nanos(start: i64, end: i64) -> Result<Self> {
        if end < start {
            return Err(Error::Config(format!(
                "time range ends ({end}ns) before it starts ({start}ns)"
            )));
        }
        Ok(Self { start, end })
    }

    /// Start of the interval in nanoseconds since the epoch.
    pub fn start_nanos(&self) -> i64 {
        self.start
    }

    /// End of the interval in nanoseconds since the epoch (exclusive).
    pub fn end_nanos(&self) -> i64 {
        self.end
    }

    /// Start of the interval in milliseconds since the epoch.
    pub fn start_millis(&self) -> i64 {
        self.start.div_euclid(NANOS_PER_MILLI)
    }

    /// End of the interval in milliseconds since the epoch.
    pub fn end_millis(&self) -> i64 {
        self.end.div_euclid(NANOS_PER_MILLI)
    }

    /// Length of the interval.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos((self.end - self.start) as u64)
    }

    /// Returns `true` if `other` lies entirely within this interval.
    pub fn contains(&self, other: &TimeInterval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Draws a sub-window of exactly `window` whose start is uniformly distributed.
    ///
    /// The start offset is sampled from `[0, span - window]`, so the returned interval is always
    /// contained in `self`. Asking for a window longer than the interval is an error; it is never
    /// clamped.
    pub fn rand_window<R: Rng + ?Sized>(&self, window: Duration, rng: &mut R) -> Result<Self> {
        let span = self.end - self.start;
        let length = i64::try_from(window.as_nanos()).unwrap_or(i64::MAX);
        if length > span {
            return Err(Error::WindowTooLarge {
                window,
                span: self.duration(),
            });
        }

        let offset = rng.random_range(0..=span - length);
        let start = self.start + offset;
        Ok(Self {
            start,
            end: start + length,
        })
    }

    /// Formats the start of the interval as an RFC 3339 timestamp with second precision.
    pub fn start_string(&self) -> String {
        humantime::format_rfc3339_seconds(from_nanos(self.start)).to_string()
    }
}

impl fmt::Debug for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeInterval")
            .field(
                "start",
                &format_args!("{}", humantime::format_rfc3339_nanos(from_nanos(self.start))),
            )
            .field(
                "end",
                &format_args!("{}", humantime::format_rfc3339_nanos(from_nanos(self.end))),
            )
            .finish()
    }
}

/// Converts a point in time into signed nanoseconds since the epoch.
pub fn to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_nanos()).unwrap_or(i64::MAX),
    }
}

/// Converts signed nanoseconds since the epoch back into a point in time.
pub fn from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}
