//! Tracing subscriber installation for the binary.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber, writing to stderr.
///
/// `verbosity` counts `-v` flags: 0 logs `info`, 1 `debug`, 2 or more
/// `trace`. A `RUST_LOG` directive replaces the default filter. Calling this
/// twice is harmless; the second installation is ignored.
pub fn init(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sortie={level}")));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .without_time()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()
        .ok();
}
