//! Console logging for the demo binary.
//!
//! Pool events reach the console through [`jobpool::TracingSink`], so the only
//! setup needed is a `tracing` subscriber. The filter is read from `RUST_LOG`
//! and defaults to `info`; use `RUST_LOG=jobpool=trace` to follow individual
//! hand-offs and worker lifecycles.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        )
        .try_init()?;

    Ok(())
}
