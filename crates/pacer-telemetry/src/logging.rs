use tracing_subscriber::{EnvFilter, fmt};

/// Install the human-readable subscriber for a pacer process.
///
/// Filter resolution: `RUST_LOG` wins when set; otherwise `default_level`
/// is parsed as an `EnvFilter` directive, so plain levels (`"info"`) and
/// per-crate filters (`"pacer_engine=debug,pacer_ledger=info"`) both work.
/// Events carry target, file, and line so a step abort or budget denial
/// can be traced back to its decision site.
///
/// Only the first call installs a subscriber; later calls (parallel test
/// binaries, re-entrant setup) are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, format = "text", "logging initialised");
}

/// Install the JSON subscriber: one object per event, for processes whose
/// stdout is tailed by a log collector.
///
/// Same `RUST_LOG`-then-`default_level` filter resolution as
/// [`init_logging`], and the same first-call-wins behaviour.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, format = "json", "logging initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging("pacer-test", "debug");
        init_logging("pacer-test", "debug");
        init_logging_json("pacer-test", "info");
        // whichever call won, the global subscriber accepts events
        tracing::debug!(reinit = true, "subscriber still live");
    }
}
