//! Operations and observability.
//!
//! - `metrics` - Process-wide counters and gauges
//! - `telemetry` - Logging setup and the metrics/health endpoint

pub mod metrics;
pub mod telemetry;

pub use metrics::*;
pub use telemetry::*;
