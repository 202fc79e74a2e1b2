use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use jobpool::DispatcherConfig;

/// Runtime configuration for the `jobpool-demo` binary.
///
/// Every value is parsed from CLI arguments or environment variables (a `.env`
/// file is loaded first), with defaults that reproduce the classic two-job
/// example on a pool of ten workers.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "jobpool-demo",
    version,
    about = "Dispatches a batch of demo jobs to a bounded worker pool"
)]
pub struct CliArgs {
    /// Number of workers in the pool.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 10)]
    pub num_workers: usize,

    /// Number of jobs to dispatch before quitting.
    ///
    /// Environment variable: `NUM_JOBS`
    #[arg(long, env = "NUM_JOBS", default_value_t = 2)]
    pub num_jobs: usize,

    /// Make every Nth job report an error (0 disables failures).
    ///
    /// Environment variable: `FAIL_EVERY`
    #[arg(long, env = "FAIL_EVERY", default_value_t = 0)]
    pub fail_every: usize,

    /// Index of a job that panics instead of returning, taking its worker
    /// down with it.
    ///
    /// Environment variable: `PANIC_JOB`
    #[arg(long, env = "PANIC_JOB")]
    pub panic_job: Option<usize>,

    /// Simulated work per job, in milliseconds.
    ///
    /// Environment variable: `JOB_DELAY_MS`
    #[arg(long, env = "JOB_DELAY_MS", default_value_t = 0)]
    pub job_delay_ms: u64,

    /// Upper bound for each shutdown phase, in seconds. Unset waits forever.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: Option<u64>,

    /// Context tag attached to every pool event.
    ///
    /// Environment variable: `LOG_TAG`
    #[arg(long, env = "LOG_TAG", default_value_t = String::from(jobpool::DEFAULT_TAG))]
    pub log_tag: String,
}

#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub dispatcher: DispatcherConfig,
    pub num_jobs: usize,
    pub fail_every: usize,
    pub panic_job: Option<usize>,
    pub job_delay: Duration,
}

impl TryFrom<CliArgs> for DemoConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 && args.num_jobs > 0 {
            bail!("NUM_WORKERS must be greater than 0 when NUM_JOBS is set");
        }

        if let Some(index) = args.panic_job {
            if index >= args.num_jobs {
                bail!(
                    "PANIC_JOB ({}) must be lower than NUM_JOBS ({})",
                    index,
                    args.num_jobs
                );
            }
        }

        let mut dispatcher = DispatcherConfig::new(args.num_workers).with_tag(args.log_tag);
        if let Some(secs) = args.shutdown_timeout_secs {
            dispatcher = dispatcher.with_shutdown_timeout(Duration::from_secs(secs));
        }
        dispatcher.validate()?;

        Ok(Self {
            dispatcher,
            num_jobs: args.num_jobs,
            fail_every: args.fail_every,
            panic_job: args.panic_job,
            job_delay: Duration::from_millis(args.job_delay_ms),
        })
    }
}
