//! Log output of the benchmark tools.
//!
//! Benchmark reports are program output and never go through here.

use std::env;
use std::io::IsTerminal;

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global tracing subscriber writing to stderr.
pub fn init_tracing(logging: &Logging) {
    let (level, env_filter) = parse_rust_log(logging.level);

    let format = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let format = match resolve_format(logging.format) {
        LogFormat::Json => format.json().boxed(),
        LogFormat::Simplified => format.compact().with_ansi(false).boxed(),
        LogFormat::Pretty | LogFormat::Auto => format.pretty().boxed(),
    };

    tracing_subscriber::registry()
        .with(format.with_filter(level))
        .with(env_filter)
        .init();
}

fn resolve_format(format: LogFormat) -> LogFormat {
    match format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    // A plain level in RUST_LOG overrides the configured level. Anything else is used literally
    // as directives.
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<Level>() {
            Ok(level) => LevelFilter::from(level),
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        reqwest=DEBUG,\
        tsbench=TRACE,\
        ",
    );

    (level, env_filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_formats_are_kept() {
        for format in [LogFormat::Pretty, LogFormat::Simplified, LogFormat::Json] {
            assert_eq!(resolve_format(format), format);
        }
        assert_ne!(resolve_format(LogFormat::Auto), LogFormat::Auto);
    }
}
