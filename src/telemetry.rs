//! Minimal logging bootstrap. The core only ever calls into `tracing`; wiring
//! those events to an actual collector or OTLP exporter is a host-process
//! concern and stays out of this crate.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize a process-wide `tracing` subscriber. Safe to call once at
/// process bootstrap; a host embedding this crate alongside other tracing
/// consumers should skip this and install its own subscriber instead.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
