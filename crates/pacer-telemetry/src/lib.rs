//! Telemetry for the pacer execution engine.
//!
//! Structured logging setup via the `tracing` ecosystem and a small set of
//! thread-safe engine counters. The engine records into [`metrics::EngineMetrics`]
//! as a side channel; nothing in the execution path ever blocks on telemetry.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_json};
pub use metrics::{EngineMetrics, MetricsSnapshot};
