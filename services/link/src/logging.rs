//! Tracing subscriber bootstrap shared by the camlink binaries.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem.
///
/// `RUST_LOG` is honoured first; the configured level is then applied to the
/// calling crate (`target`) and to the shared `camlink` library.
pub fn init(config: &LoggingConfig, target: &str) -> anyhow::Result<()> {
    let level = level_name(&config.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("{}={}", target, level).parse()?)
        .add_directive(format!("camlink={}", level).parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()?;
    }

    Ok(())
}

fn level_name(level: &str) -> &'static str {
    match level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}
