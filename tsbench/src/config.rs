//! Configuration for the benchmark tools.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command line flags
//! 2. Environment variables (prefixed with `TSBENCH__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `TSBENCH__` as a prefix and double underscores (`__`) to denote
//! nested configuration structures. For example:
//!
//! - `TSBENCH__WORKERS=8` sets the number of workers
//! - `TSBENCH__TARGET__TYPE=http` selects the HTTP target
//! - `TSBENCH__GENERATOR__SCALE_VAR=100` simulates 100 hosts
//!
//! # YAML Configuration File
//!
//! ```yaml
//! workers: 8
//! print_interval: 1000
//!
//! target:
//!   type: http
//!   url: http://localhost:8086
//!   database: benchmark_db
//!
//! generator:
//!   scale_var: 100
//!   start: 2016-01-01T00:00:00Z
//!   end: 2016-01-02T00:00:00Z
//! ```

use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use figment::providers::{Env, Format as _, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::bench::AggregationPlan;
use crate::data_gen::{DEFAULT_SAMPLING_INTERVAL, DEFAULT_SCALE_VAR};
use crate::error::Result;
use crate::executor::{Distribution, ExecutorConfig};
use crate::interval::TimeInterval;
use crate::load::DEFAULT_COMPLETION_TIMEOUT;
use crate::query_gen::QueryType;
use crate::serializer::Format;
use crate::stats::StatsSettings;
use crate::target::http::DEFAULT_BATCH_SIZE;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "TSBENCH__";

/// Start of the default time range, `2016-01-01T00:00:00Z`.
const DEFAULT_START_SECS: u64 = 1_451_606_400;
const DAY: Duration = Duration::from_secs(24 * 3600);

/// Main configuration struct shared by all subcommands.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of concurrent workers.
    ///
    /// # Default
    ///
    /// `1`
    pub workers: usize,

    /// Stop after this many items. Unlimited if absent.
    pub limit: Option<u64>,

    /// Print a snapshot to stderr after this many operations, `0` to disable.
    ///
    /// # Default
    ///
    /// `100`
    pub print_interval: u64,

    /// Number of leading operations excluded from statistics.
    pub burn_in: u64,

    /// How long workers wait for pending writes when their input is exhausted.
    ///
    /// # Default
    ///
    /// `5s`
    #[serde(with = "humantime_serde")]
    pub completion_timeout: Duration,

    /// Where query benchmarks aggregate.
    ///
    /// # Default
    ///
    /// `server`
    #[serde(with = "display_fromstr")]
    pub aggregation_plan: AggregationPlan,

    /// Logging configuration.
    pub logging: Logging,

    /// Target system configuration.
    pub target: Target,

    /// Workload generator configuration.
    pub generator: Generator,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            limit: None,
            print_interval: 100,
            burn_in: 0,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            aggregation_plan: AggregationPlan::Server,
            logging: Logging::default(),
            target: Target::default(),
            generator: Generator::default(),
        }
    }
}

impl Config {
    /// Loads configuration from defaults, an optional YAML file, and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML file cannot be read or parsed, or if environment variables
    /// contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Executor parameters with the given distribution.
    pub fn executor(&self, distribution: Distribution) -> ExecutorConfig {
        ExecutorConfig {
            workers: self.workers,
            limit: self.limit,
            distribution,
        }
    }

    /// Stats aggregator parameters.
    pub fn stats(&self, global_label: &'static str, unit: &'static str) -> StatsSettings {
        StatsSettings {
            burn_in: self.burn_in,
            print_interval: self.print_interval,
            workers: self.workers,
            global_label,
            unit,
        }
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr. The `RUST_LOG` environment variable takes precedence over
/// `level` when set.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// # Default
    ///
    /// `INFO`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `auto` (pretty for TTY, simplified otherwise)
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// The log format of the fmt layer.
///
/// The format can be set explicitly or auto-detected based on whether stderr is a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    ///
    /// ```text
    /// 2016-01-01T00:00:00.000000Z  INFO tsbench::load: dataset size points=8640 values=86400
    /// ```
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

/// The target system benchmarks run against.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Target {
    /// In-process TSDB.
    ///
    /// # Example
    ///
    /// ```yaml
    /// target:
    ///   type: memory
    ///   preload: true
    /// ```
    Memory {
        /// Fill the store from the devops generator before querying.
        #[serde(default)]
        preload: bool,
    },

    /// Write-only HTTP endpoint accepting line protocol.
    ///
    /// # Example
    ///
    /// ```yaml
    /// target:
    ///   type: http
    ///   url: http://localhost:8086
    ///   database: benchmark_db
    ///   batch_size: 5000
    ///   timeout: 10s
    /// ```
    Http {
        /// Base URL of the server.
        url: String,
        /// Database written to.
        #[serde(default = "default_database")]
        database: String,
        /// Samples per request.
        #[serde(default = "default_batch_size")]
        batch_size: usize,
        /// Request timeout.
        #[serde(default = "default_timeout", with = "humantime_serde")]
        timeout: Duration,
    },
}

impl Default for Target {
    fn default() -> Self {
        Self::Memory { preload: false }
    }
}

fn default_database() -> String {
    "benchmark_db".to_owned()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Workload generator configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Generator {
    /// Number of simulated hosts.
    ///
    /// # Default
    ///
    /// `1`
    pub scale_var: usize,

    /// Inclusive start of the simulated time range.
    ///
    /// # Default
    ///
    /// `2016-01-01T00:00:00Z`
    #[serde(with = "humantime_serde")]
    pub start: SystemTime,

    /// Exclusive end of the simulated time range.
    ///
    /// # Default
    ///
    /// `2016-01-02T00:00:00Z`
    #[serde(with = "humantime_serde")]
    pub end: SystemTime,

    /// Seed of the random source.
    pub seed: u64,

    /// Draw randomness from entropy instead of `seed`.
    pub unseeded: bool,

    /// Time between two points of the same host.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Query mix of `generate-queries`.
    ///
    /// # Default
    ///
    /// `1-host-1-hr`
    #[serde(with = "display_fromstr")]
    pub query_type: QueryType,

    /// Output format of `generate-data`.
    ///
    /// # Default
    ///
    /// `influx`
    #[serde(with = "display_fromstr")]
    pub format: Format,
}

impl Default for Generator {
    fn default() -> Self {
        let start = UNIX_EPOCH + Duration::from_secs(DEFAULT_START_SECS);
        Self {
            scale_var: DEFAULT_SCALE_VAR,
            start,
            end: start + DAY,
            seed: crate::DEFAULT_SEED,
            unseeded: false,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            query_type: QueryType::OneHostOneHour,
            format: Format::Influx,
        }
    }
}

impl Generator {
    /// The configured time range.
    pub fn interval(&self) -> Result<TimeInterval> {
        TimeInterval::new(self.start, self.end)
    }

    /// The seed to use, `None` for entropy.
    pub fn seed(&self) -> Option<u64> {
        (!self.unseeded).then_some(self.seed)
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
