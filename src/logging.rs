//! Tracing subscriber setup
//!
//! One call at process start; library code only ever emits through
//! `tracing` macros and never installs subscribers of its own.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` with an `info` default. With
/// `json_output` set, events are emitted as single-line JSON for log
/// shippers; otherwise as human-readable lines on stderr. Calling this
/// twice is a no-op (useful in tests).
pub fn init(json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let result = if json_output {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber was already installed");
    }
}
