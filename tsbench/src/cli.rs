//! Command line interface of the benchmarking suite.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use bytesize::ByteSize;
use yansi::Paint;

use crate::bench::{AggregationPlan, QueryHandler};
use crate::config::{Config, Generator, Target};
use crate::data_gen::DevopsSimulator;
use crate::executor::{Distribution, Executor};
use crate::load::{LineDecoder, WriteHandler};
use crate::point::Point;
use crate::pool::{Pool, Recycle};
use crate::query::{Query, QueryReader, QueryWriter};
use crate::query_gen::{QueryGenerator, QueryType};
use crate::run::{RunSummary, run_benchmark};
use crate::serializer::Format;
use crate::stats::{ALL_QUERIES, ALL_WRITES};
use crate::target::BoxedAppender;
use crate::target::http::HttpAppender;
use crate::target::in_memory::InMemoryTsdb;
use crate::{observability, target};

/// Time series database benchmarking suite.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    GenerateData(GenerateDataCommand),
    GenerateQueries(GenerateQueriesCommand),
    Load(LoadCommand),
    Query(QueryCommand),
}

/// write a simulated devops dataset to stdout
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "generate-data")]
struct GenerateDataCommand {
    /// output format: influx, tsdb or tsdb-csv
    #[argh(option)]
    format: Option<Format>,

    /// number of simulated hosts
    #[argh(option)]
    scale_var: Option<usize>,

    /// seed of the random source
    #[argh(option)]
    seed: Option<u64>,

    /// draw randomness from entropy
    #[argh(switch)]
    unseeded: bool,

    /// inclusive start of the time range, RFC 3339
    #[argh(option, from_str_fn(parse_time))]
    start: Option<SystemTime>,

    /// exclusive end of the time range, RFC 3339
    #[argh(option, from_str_fn(parse_time))]
    end: Option<SystemTime>,

    /// time between two points of the same host, e.g. 10s
    #[argh(option)]
    sampling_interval: Option<humantime::Duration>,
}

/// write a binary query stream to stdout
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "generate-queries")]
struct GenerateQueriesCommand {
    /// query mix, e.g. 1-host-1-hr, groupby or all
    #[argh(option)]
    query_type: Option<QueryType>,

    /// number of queries to generate
    #[argh(option, default = "1000")]
    count: u64,

    /// number of simulated hosts
    #[argh(option)]
    scale_var: Option<usize>,

    /// seed of the random source
    #[argh(option)]
    seed: Option<u64>,

    /// draw randomness from entropy
    #[argh(switch)]
    unseeded: bool,

    /// inclusive start of the time range, RFC 3339
    #[argh(option, from_str_fn(parse_time))]
    start: Option<SystemTime>,

    /// exclusive end of the time range, RFC 3339
    #[argh(option, from_str_fn(parse_time))]
    end: Option<SystemTime>,
}

/// append a pipe-format dataset to a target
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "load")]
struct LoadCommand {
    /// number of concurrent workers
    #[argh(option)]
    workers: Option<usize>,

    /// stop after this many samples, -1 for unlimited
    #[argh(option)]
    limit: Option<i64>,

    /// print a snapshot every N writes, 0 to disable
    #[argh(option)]
    print_interval: Option<u64>,

    /// number of leading writes excluded from statistics
    #[argh(option)]
    burn_in: Option<u64>,

    /// input file, stdin if absent
    #[argh(option)]
    file: Option<PathBuf>,

    /// target system: memory or http
    #[argh(option)]
    target: Option<String>,

    /// base URL of the http target
    #[argh(option)]
    url: Option<String>,

    /// database of the http target
    #[argh(option)]
    database: Option<String>,
}

/// run a binary query stream against the in-memory target
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "query")]
struct QueryCommand {
    /// number of concurrent workers
    #[argh(option)]
    workers: Option<usize>,

    /// stop after this many queries, -1 for unlimited
    #[argh(option)]
    limit: Option<i64>,

    /// print a snapshot every N queries, 0 to disable
    #[argh(option)]
    print_interval: Option<u64>,

    /// number of leading queries excluded from statistics
    #[argh(option)]
    burn_in: Option<u64>,

    /// input file, stdin if absent
    #[argh(option)]
    file: Option<PathBuf>,

    /// where to aggregate: server or client
    #[argh(option)]
    aggregation_plan: Option<AggregationPlan>,

    /// fill the target with the configured dataset first
    #[argh(switch)]
    preload: bool,
}

fn parse_time(value: &str) -> Result<SystemTime, String> {
    humantime::parse_rfc3339_weak(value).map_err(|e| format!("invalid time `{value}`: {e}"))
}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    let mut config = Config::load(args.config.as_deref()).context("failed to load config")?;
    args.command.apply(&mut config)?;

    yansi::whenever(yansi::Condition::TTY_AND_COLOR);
    observability::init_tracing(&config.logging);
    tracing::debug!(?config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tsbench-rt")
        .enable_all()
        .build()?;

    match args.command {
        Command::GenerateData(_) => generate_data(&config.generator),
        Command::GenerateQueries(GenerateQueriesCommand { count, .. }) => {
            generate_queries(&config.generator, count)
        }
        Command::Load(LoadCommand { file, .. }) => {
            let summary = runtime.block_on(load(&config, open_input(file.as_deref())?))?;
            print_wall_clock(summary.wall_clock);
            Ok(())
        }
        Command::Query(QueryCommand { file, .. }) => {
            let summary = runtime.block_on(query(&config, open_input(file.as_deref())?))?;
            print_wall_clock(summary.wall_clock);
            Ok(())
        }
    }
}

impl Command {
    /// Applies command line flags on top of the loaded configuration.
    fn apply(&self, config: &mut Config) -> Result<()> {
        match self {
            Command::GenerateData(cmd) => {
                apply_generator(
                    &mut config.generator,
                    cmd.scale_var,
                    cmd.seed,
                    cmd.unseeded,
                    cmd.start,
                    cmd.end,
                );
                if let Some(format) = cmd.format {
                    config.generator.format = format;
                }
                if let Some(interval) = cmd.sampling_interval {
                    config.generator.sampling_interval = interval.into();
                }
            }
            Command::GenerateQueries(cmd) => {
                apply_generator(
                    &mut config.generator,
                    cmd.scale_var,
                    cmd.seed,
                    cmd.unseeded,
                    cmd.start,
                    cmd.end,
                );
                if let Some(query_type) = cmd.query_type {
                    config.generator.query_type = query_type;
                }
            }
            Command::Load(cmd) => {
                apply_run(config, cmd.workers, cmd.limit, cmd.print_interval, cmd.burn_in)?;
                apply_target(
                    &mut config.target,
                    cmd.target.as_deref(),
                    cmd.url.as_deref(),
                    cmd.database.as_deref(),
                )?;
            }
            Command::Query(cmd) => {
                apply_run(config, cmd.workers, cmd.limit, cmd.print_interval, cmd.burn_in)?;
                if let Some(plan) = cmd.aggregation_plan {
                    config.aggregation_plan = plan;
                }
                if cmd.preload {
                    if let Target::Memory { preload } = &mut config.target {
                        *preload = true;
                    }
                }
            }
        }
        Ok(())
    }
}

fn apply_generator(
    generator: &mut Generator,
    scale_var: Option<usize>,
    seed: Option<u64>,
    unseeded: bool,
    start: Option<SystemTime>,
    end: Option<SystemTime>,
) {
    if let Some(scale_var) = scale_var {
        generator.scale_var = scale_var;
    }
    if let Some(seed) = seed {
        generator.seed = seed;
        generator.unseeded = false;
    }
    if unseeded {
        generator.unseeded = true;
    }
    if let Some(start) = start {
        generator.start = start;
    }
    if let Some(end) = end {
        generator.end = end;
    }
}

fn apply_run(
    config: &mut Config,
    workers: Option<usize>,
    limit: Option<i64>,
    print_interval: Option<u64>,
    burn_in: Option<u64>,
) -> Result<()> {
    if let Some(workers) = workers {
        config.workers = workers;
    }
    match limit {
        None => {}
        Some(-1) => config.limit = None,
        Some(limit) => match u64::try_from(limit) {
            Ok(limit) => config.limit = Some(limit),
            Err(_) => bail!("invalid --limit {limit}: expected -1 or a non-negative count"),
        },
    }
    if let Some(print_interval) = print_interval {
        config.print_interval = print_interval;
    }
    if let Some(burn_in) = burn_in {
        config.burn_in = burn_in;
    }
    Ok(())
}

fn apply_target(
    target: &mut Target,
    kind: Option<&str>,
    url: Option<&str>,
    database: Option<&str>,
) -> Result<()> {
    match kind {
        None => {}
        Some("memory") => {
            if !matches!(target, Target::Memory { .. }) {
                *target = Target::Memory { preload: false };
            }
        }
        Some("http") => {
            if !matches!(target, Target::Http { .. }) {
                let Some(url) = url else {
                    bail!("the http target requires --url");
                };
                *target = Target::Http {
                    url: url.to_owned(),
                    database: "benchmark_db".to_owned(),
                    batch_size: target::http::DEFAULT_BATCH_SIZE,
                    timeout: Duration::from_secs(10),
                };
            }
        }
        Some(other) => bail!(r#"unknown target "{other}": expected "memory" or "http""#),
    }

    if let Target::Http {
        url: current_url,
        database: current_database,
        ..
    } = target
    {
        if let Some(url) = url {
            url.clone_into(current_url);
        }
        if let Some(database) = database {
            database.clone_into(current_database);
        }
    }
    Ok(())
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead + Send>> {
    Ok(match path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open input file {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(io::stdin())),
    })
}

fn simulator(generator: &Generator) -> Result<DevopsSimulator> {
    let simulator = DevopsSimulator::builder(generator.interval()?)
        .scale_var(generator.scale_var)
        .sampling_interval(generator.sampling_interval)
        .seed(generator.seed())
        .build()?;
    Ok(simulator)
}

fn generate_data(generator: &Generator) -> Result<()> {
    let mut simulator = simulator(generator)?;
    let format = generator.format;
    let serializer = format.serializer(Pool::shared());

    let mut out = BufWriter::new(io::stdout().lock());
    let mut point = Point::default();
    while simulator.next_point(&mut point) {
        format.write_point(serializer.as_ref(), &mut out, &point)?;
        point.recycle();
    }
    serializer.serialize_size(&mut out, simulator.points(), simulator.values())?;
    out.flush()?;

    tracing::info!(
        points = simulator.points(),
        values = simulator.values(),
        %format,
        "generated dataset"
    );
    Ok(())
}

fn generate_queries(generator: &Generator, count: u64) -> Result<()> {
    let mut queries = QueryGenerator::builder(generator.interval()?)
        .scale_var(generator.scale_var)
        .query_type(generator.query_type)
        .seed(generator.seed())
        .build()?;

    let mut writer = QueryWriter::new(BufWriter::new(io::stdout().lock()));
    let mut query = Query::default();
    for i in 0..count {
        queries.dispatch(i, &mut query)?;
        writer.write(&query)?;
        query.release();
    }
    let written = writer.written();
    writer.finish()?;

    tracing::info!(queries = written, query_type = %generator.query_type, "generated queries");
    Ok(())
}

/// Per-worker appenders of the configured target.
enum Appenders {
    Memory(InMemoryTsdb),
    Http {
        url: String,
        database: String,
        batch_size: usize,
        timeout: Duration,
    },
}

impl Appenders {
    fn new(target: &Target) -> Self {
        match target {
            Target::Memory { .. } => Self::Memory(InMemoryTsdb::new()),
            Target::Http {
                url,
                database,
                batch_size,
                timeout,
            } => Self::Http {
                url: url.clone(),
                database: database.clone(),
                batch_size: *batch_size,
                timeout: *timeout,
            },
        }
    }

    fn create(&self) -> crate::Result<BoxedAppender> {
        Ok(match self {
            Self::Memory(db) => Box::new(db.appender()),
            Self::Http {
                url,
                database,
                batch_size,
                timeout,
            } => Box::new(HttpAppender::new(url, database, *batch_size, *timeout)?),
        })
    }
}

async fn load(config: &Config, input: Box<dyn BufRead + Send>) -> Result<RunSummary> {
    let executor = Executor::new(
        config.executor(Distribution::sharded()),
        Pool::shared(),
        Pool::shared(),
    );
    let decoder = LineDecoder::new(input);
    let bytes_read = decoder.bytes_read();
    let appenders = Appenders::new(&config.target);
    let completion_timeout = config.completion_timeout;

    let summary = run_benchmark(
        &executor,
        decoder,
        |_| Ok(WriteHandler::new(appenders.create()?, completion_timeout)),
        config.stats(ALL_WRITES, "writes"),
        io::stderr(),
        io::stdout(),
    )
    .await
    .context("load failed")?;

    let seconds = summary.wall_clock.as_secs_f64();
    let items = summary.report.processed;
    let bytes = bytes_read.load(Ordering::Relaxed);
    tracing::info!(
        items,
        seconds,
        rate = items as f64 / seconds,
        bytes_per_sec = %ByteSize::b((bytes as f64 / seconds) as u64),
        "loaded samples"
    );
    Ok(summary)
}

async fn query(config: &Config, input: Box<dyn BufRead + Send>) -> Result<RunSummary> {
    let Target::Memory { preload } = config.target else {
        bail!("query benchmarks require the memory target");
    };

    let db = InMemoryTsdb::new();
    if preload {
        let samples = crate::load::preload(&db, simulator(&config.generator)?);
        tracing::info!(samples, series = db.series_count(), "preloaded dataset");
    }

    let executor = Executor::<Query>::new(
        config.executor(Distribution::Shared),
        Pool::shared(),
        Pool::shared(),
    );
    let decoder = QueryReader::new(input);
    let plan = config.aggregation_plan;

    let summary = run_benchmark(
        &executor,
        decoder,
        |_| Ok(QueryHandler::new(Box::new(db.querier()), plan)),
        config.stats(ALL_QUERIES, "queries"),
        io::stderr(),
        io::stdout(),
    )
    .await
    .context("query benchmark failed")?;

    tracing::info!(
        queries = summary.report.processed,
        seconds = summary.wall_clock.as_secs_f64(),
        "queries complete"
    );
    Ok(summary)
}

fn print_wall_clock(elapsed: Duration) {
    let seconds = format!("{:.6}", elapsed.as_secs_f64());
    println!("wall clock time: {}sec", seconds.bold());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minus_one_limit_is_unlimited() {
        let mut config = Config::default();
        apply_run(&mut config, Some(4), Some(-1), None, Some(10)).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.limit, None);
        assert_eq!(config.burn_in, 10);

        apply_run(&mut config, None, Some(250), None, None).unwrap();
        assert_eq!(config.limit, Some(250));
        apply_run(&mut config, None, Some(0), None, None).unwrap();
        assert_eq!(config.limit, Some(0));
    }

    #[test]
    fn other_negative_limits_are_rejected() {
        let mut config = Config::default();
        apply_run(&mut config, None, Some(7), None, None).unwrap();

        for limit in [-2, -100, i64::MIN] {
            let err = apply_run(&mut config, None, Some(limit), None, None).unwrap_err();
            assert!(err.to_string().contains("invalid --limit"), "{err}");
        }
        assert_eq!(config.limit, Some(7));
    }

    #[test]
    fn http_target_needs_url() {
        let mut target = Target::default();
        assert!(apply_target(&mut target, Some("http"), None, None).is_err());

        apply_target(
            &mut target,
            Some("http"),
            Some("http://localhost:8086"),
            Some("bench"),
        )
        .unwrap();
        let Target::Http { url, database, .. } = &target else {
            panic!("expected http target, got {target:?}");
        };
        assert_eq!(url, "http://localhost:8086");
        assert_eq!(database, "bench");

        assert!(apply_target(&mut target, Some("carbon"), None, None).is_err());
    }

    #[test]
    fn seed_flags() {
        let mut generator = Generator::default();
        apply_generator(&mut generator, Some(8), None, true, None, None);
        assert_eq!(generator.scale_var, 8);
        assert_eq!(generator.seed(), None);

        apply_generator(&mut generator, None, Some(3), false, None, None);
        assert_eq!(generator.seed(), Some(3));
    }

    #[test]
    fn parses_rfc3339_times() {
        assert_eq!(
            parse_time("2016-01-01T00:00:00Z").unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_451_606_400)
        );
        assert!(parse_time("yesterday").is_err());
    }
}
