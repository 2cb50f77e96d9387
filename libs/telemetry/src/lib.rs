//! Logging setup shared by the support chat services.

use anyhow::Result;

mod config;
mod tracing_init;

pub use config::TelemetryConfig;
pub use tracing_init::init_telemetry;

/// Installs the shared subscriber configured from `RUST_LOG` and
/// `LOG_FORMAT`.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name))
}
