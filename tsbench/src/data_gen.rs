//! Devops data points: cpu usage of a simulated fleet of hosts.
//!
//! The simulator walks the configured time range in steps of the sampling interval and emits one
//! `cpu` point per host and step. Host tags are fixed when the fleet is created; cpu fields
//! follow bounded random walks in `[0, 100]`.

use std::time::Duration;

use rand::Rng;
use rand::rngs::SmallRng;

use crate::error::{Error, Result};
use crate::interval::TimeInterval;
use crate::point::{FieldValue, Point};

/// Measurement name of generated points.
pub const CPU_MEASUREMENT: &str = "cpu";

/// Field names of generated points, in emission order.
pub const CPU_FIELDS: [&str; 10] = [
    "usage_user",
    "usage_system",
    "usage_idle",
    "usage_nice",
    "usage_iowait",
    "usage_irq",
    "usage_softirq",
    "usage_steal",
    "usage_guest",
    "usage_guest_nice",
];

const REGIONS: &[(&str, &[&str])] = &[
    ("us-east-1", &["us-east-1a", "us-east-1b", "us-east-1c", "us-east-1e"]),
    ("us-west-1", &["us-west-1a", "us-west-1b"]),
    ("us-west-2", &["us-west-2a", "us-west-2b", "us-west-2c"]),
    ("eu-west-1", &["eu-west-1a", "eu-west-1b", "eu-west-1c"]),
    ("eu-central-1", &["eu-central-1a", "eu-central-1b"]),
    ("ap-southeast-1", &["ap-southeast-1a", "ap-southeast-1b"]),
    ("ap-southeast-2", &["ap-southeast-2a", "ap-southeast-2b"]),
    ("ap-northeast-1", &["ap-northeast-1a", "ap-northeast-1c"]),
    ("sa-east-1", &["sa-east-1a", "sa-east-1b", "sa-east-1c"]),
];
const OPERATING_SYSTEMS: &[&str] = &["Ubuntu16.10", "Ubuntu16.04LTS", "Ubuntu15.10"];
const ARCHITECTURES: &[&str] = &["x64", "x86"];
const TEAMS: &[&str] = &["SF", "NYC", "LON", "CHI"];
const ENVIRONMENTS: &[&str] = &["production", "staging", "test"];

/// Default fleet size.
pub const DEFAULT_SCALE_VAR: usize = 1;
/// Default spacing of points of one host.
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_secs(10);

/// A builder for a [`DevopsSimulator`].
#[derive(Debug)]
pub struct SimulatorBuilder {
    interval: TimeInterval,
    scale_var: usize,
    sampling_interval: Duration,
    seed: Option<u64>,
}

impl SimulatorBuilder {
    /// Number of simulated hosts.
    pub fn scale_var(mut self, scale_var: usize) -> Self {
        self.scale_var = scale_var;
        self
    }

    /// Time between two points of the same host.
    pub fn sampling_interval(mut self, sampling_interval: Duration) -> Self {
        self.sampling_interval = sampling_interval;
        self
    }

    /// Seeds the random source, or draws from entropy for `None`.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Creates the simulator and its fleet.
    pub fn build(self) -> Result<DevopsSimulator> {
        if self.scale_var == 0 {
            return Err(Error::Config("scale_var must be at least 1".to_owned()));
        }
        let step = i64::try_from(self.sampling_interval.as_nanos()).unwrap_or(i64::MAX);
        if step == 0 {
            return Err(Error::Config("sampling interval must not be zero".to_owned()));
        }

        let mut rng = crate::seeded_rng(self.seed);
        let hosts = (0..self.scale_var).map(|id| Host::new(id, &mut rng)).collect();

        Ok(DevopsSimulator {
            timestamp: self.interval.start_nanos(),
            interval: self.interval,
            step,
            hosts,
            rng,
            next_host: 0,
            points: 0,
            values: 0,
        })
    }
}

#[derive(Debug)]
struct Host {
    tags: Vec<(&'static str, String)>,
    cpu: [f64; CPU_FIELDS.len()],
}

impl Host {
    fn new(id: usize, rng: &mut SmallRng) -> Self {
        let (region, datacenters) = REGIONS[rng.random_range(0..REGIONS.len())];
        let datacenter = datacenters[rng.random_range(0..datacenters.len())];

        let tags = vec![
            ("hostname", format!("host_{id}")),
            ("region", region.to_owned()),
            ("datacenter", datacenter.to_owned()),
            ("rack", rng.random_range(0..100u32).to_string()),
            ("os", pick(rng, OPERATING_SYSTEMS).to_owned()),
            ("arch", pick(rng, ARCHITECTURES).to_owned()),
            ("team", pick(rng, TEAMS).to_owned()),
            ("service", rng.random_range(0..20u32).to_string()),
            ("service_version", rng.random_range(0..2u32).to_string()),
            ("service_environment", pick(rng, ENVIRONMENTS).to_owned()),
        ];

        let mut cpu = [0.0; CPU_FIELDS.len()];
        for value in &mut cpu {
            *value = rng.random_range(0.0..100.0);
        }

        Self { tags, cpu }
    }

    fn step(&mut self, rng: &mut SmallRng) {
        for value in &mut self.cpu {
            *value = (*value + rng.random_range(-1.0..=1.0)).clamp(0.0, 100.0);
        }
    }
}

fn pick(rng: &mut SmallRng, choices: &[&'static str]) -> &'static str {
    choices[rng.random_range(0..choices.len())]
}

/// Generator of devops `cpu` points.
#[derive(Debug)]
pub struct DevopsSimulator {
    interval: TimeInterval,
    step: i64,
    hosts: Vec<Host>,
    rng: SmallRng,
    timestamp: i64,
    next_host: usize,
    points: u64,
    values: u64,
}

impl DevopsSimulator {
    /// Constructs a builder for a simulator covering `interval`.
    pub fn builder(interval: TimeInterval) -> SimulatorBuilder {
        SimulatorBuilder {
            interval,
            scale_var: DEFAULT_SCALE_VAR,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            seed: Some(crate::DEFAULT_SEED),
        }
    }

    /// Returns `true` once every point of the time range was emitted.
    pub fn finished(&self) -> bool {
        self.timestamp >= self.interval.end_nanos()
    }

    /// Fills `point` with the next point. Returns `false` when finished.
    ///
    /// `point` must be empty, e.g. freshly taken from a pool.
    pub fn next_point(&mut self, point: &mut Point) -> bool {
        if self.finished() {
            return false;
        }

        let host = &mut self.hosts[self.next_host];
        host.step(&mut self.rng);

        point.set_measurement(CPU_MEASUREMENT);
        for (key, value) in &host.tags {
            point.push_tag(*key, value.as_str());
        }
        for (field, value) in CPU_FIELDS.iter().zip(host.cpu) {
            point.push_field(*field, FieldValue::Float(value));
        }
        point.timestamp = self.timestamp;

        self.points += 1;
        self.values += CPU_FIELDS.len() as u64;
        self.next_host += 1;
        if self.next_host == self.hosts.len() {
            self.next_host = 0;
            self.timestamp = self.timestamp.saturating_add(self.step);
        }
        true
    }

    /// Points emitted so far.
    pub fn points(&self) -> u64 {
        self.points
    }

    /// Field values emitted so far.
    pub fn values(&self) -> u64 {
        self.values
    }
}
