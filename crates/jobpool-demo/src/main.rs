#![doc = include_str!("../README.md")]

mod config;
mod telemetry;

use clap::Parser;
use config::{CliArgs, DemoConfig};
use jobpool::{Dispatcher, Event, EventLevel, EventSink, JobOutput, MemorySink, TracingSink};
use std::sync::Arc;
use telemetry::init_telemetry;
use tokio::signal;

/// Forwards every event to the console and keeps a copy for the run summary.
struct DemoSink {
    console: TracingSink,
    history: MemorySink,
}

impl EventSink for DemoSink {
    fn record(&self, event: Event) {
        self.console.record(event.clone());
        self.history.record(event);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = DemoConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let sink = Arc::new(DemoSink {
        console: TracingSink::new(),
        history: MemorySink::new(),
    });
    let mut dispatcher = Dispatcher::with_config(config.dispatcher.clone(), sink.clone())?;
    dispatcher.run()?;

    tokio::select! {
        res = dispatch_all(&dispatcher, &config) => res?,
        () = shutdown_signal() => {
            tracing::info!("Shutdown signal received, quitting before every job was dispatched");
        }
    }

    dispatcher.quit().await;

    let history = &sink.history;
    tracing::info!(
        "Run finished: {} succeeded, {} failed, {} error events, {} events recorded",
        history.job_events(EventLevel::Info).len(),
        history.job_events(EventLevel::Error).len(),
        history.errors().len(),
        history.len()
    );
    Ok(())
}

async fn dispatch_all(dispatcher: &Dispatcher, config: &DemoConfig) -> anyhow::Result<()> {
    for index in 0..config.num_jobs {
        let id = format!("job-{index}");
        let fails = config.fail_every > 0 && (index + 1) % config.fail_every == 0;
        let panics = config.panic_job == Some(index);
        let delay = config.job_delay;

        dispatcher
            .dispatch(move || {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                if panics {
                    panic!("{id} panicked on purpose");
                }
                if fails {
                    JobOutput::failure(id, "simulated failure")
                } else {
                    JobOutput::success(id)
                }
            })
            .await?;
    }
    Ok(())
}

fn log_startup_info(config: &DemoConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting jobpool demo with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting jobpool demo: {} jobs on {} workers",
            config.num_jobs,
            config.dispatcher.max_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }
}
