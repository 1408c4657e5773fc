//! Common building blocks for tarpipe.
//!
//! - [`walk`] enumerates regular files and assigns their archive names
//! - [`archive`] provides the container writers behind one [`archive::ArchiveWriter`] trait
//! - [`fanout`] drives a single walk into a whole set of writers
//! - [`phase`] coordinates the tasks of one transfer phase with first-error-wins semantics
//!
//! [`run`] sets up logging and the tokio runtime for the command-line tools.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

pub mod archive;
pub mod config;
pub mod fanout;
pub mod phase;
pub mod walk;

pub use config::{OutputConfig, RuntimeConfig};

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(output.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed to create tokio runtime")
}

/// The one line printed for a failed run, or `None` in quiet mode.
fn diagnostic(output: &OutputConfig, error: &impl std::fmt::Display) -> Option<String> {
    (!output.quiet).then(|| format!("{error:#}"))
}

fn report(output: &OutputConfig, error: &impl std::fmt::Display) {
    if let Some(line) = diagnostic(output, error) {
        eprintln!("{line}");
    }
}

/// Runs `func` on a fresh runtime and reports its outcome.
///
/// Errors are printed on one line unless `quiet` is set and `None` is returned, so the caller
/// can exit with a failure status. The summary is printed when requested or when verbose.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display + std::fmt::Debug,
    Fut: Future<Output = Result<Summary, Error>>,
{
    if let Err(error) = init_tracing(&output) {
        report(&output, &error);
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            report(&output, &error);
            return None;
        }
    };
    let res = runtime.block_on(func());
    // blocking tasks of an abandoned phase may still be stuck on a dead pipe
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::debug!("run failed: {:?}", error);
            report(&output, &error);
            None
        }
    }
}
