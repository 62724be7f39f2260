//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `RUST_LOG` directives win over `default_level`, which only applies to
/// targets the environment does not mention.
pub fn init(default_level: filter::LevelFilter) {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}

/// Parses a verbosity name such as `info` or `DEBUG`.
///
/// Unknown names fall back to `INFO`.
pub fn parse_level(level: &str) -> filter::LevelFilter {
    level
        .trim()
        .parse::<filter::LevelFilter>()
        .unwrap_or(filter::LevelFilter::INFO)
}
