//! Logging infrastructure for Barpath.
//!
//! All diagnostics go to stderr so that the CLI's stdout stays reserved for
//! operator-facing output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Map a `-v` count onto a default level
///
/// 0 = warn, 1 = info, 2 = debug, 3+ = trace. `RUST_LOG` still wins.
pub fn init_with_verbosity(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    init_with_level(level)
}

/// Initialize logging with a specific default level
///
/// Uses `try_init` so that calling this twice (e.g. from a test harness that
/// already installed a subscriber) is harmless.
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}
