//! Logging setup.
//!
//! `RUST_LOG` controls levels; without it the default is
//! `info,toolbridge=debug`. Provider stderr is logged at `debug` under the
//! `toolbridge::provider_stderr` target, so `RUST_LOG=toolbridge::provider_stderr=off`
//! silences it.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,toolbridge=debug";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Human-readable logs on stderr.
pub fn init() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .init();
}

/// One JSON object per event on stderr.
pub fn init_json() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter())
        .with(fmt_layer)
        .init();
}
