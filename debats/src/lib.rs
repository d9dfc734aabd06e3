//! ETL pipeline for the debates of the French Assemblée Nationale.

use tracing_subscriber::EnvFilter;

pub mod batch;
pub mod dila;
pub mod es;
pub mod monitor;
pub mod orchestrator;
pub mod report;
pub mod transform;

/// Install a log subscriber filtered by `RUST_LOG` (default `info`).
///
/// Calling this more than once is harmless.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
