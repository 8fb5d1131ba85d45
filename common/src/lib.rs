//! Backend-agnostic transfer core shared by the xfer tools.
//!
//! - [`address`]: connection-string parsing into an [`address::Endpoint`]
//! - [`client`]: the capability contract every storage backend implements
//! - [`file`]: files, listings and destination path mapping
//! - [`fingerprint`] and [`resume`]: the skip / resume / restart protocol
//! - [`transfer`]: the worker-pool orchestrator
//! - [`local`]: the local filesystem backend
//!
//! Binaries drive everything through [`run`], which sets up logging, throttling, the tokio
//! runtime and the progress display around an async main function.

use std::io::IsTerminal;

pub mod address;
pub mod client;
pub mod config;
pub mod error;
pub mod file;
pub mod fingerprint;
pub mod local;
pub mod progress;
pub mod resume;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide progress counters fed by every transfer in this process.
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar on a terminal, text updates otherwise
    #[default]
    Auto,
    /// Interactive byte progress bar
    ProgressBar,
    /// Periodic text snapshots, suitable for log files
    TextUpdates,
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human-readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

fn progress_bar_loop(delay: std::time::Duration, stop: &std::sync::mpsc::Receiver<()>) {
    let progress = get_progress();
    let bar = indicatif::ProgressBar::new(progress.bytes_total());
    let style = indicatif::ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
    .progress_chars("=> ");
    bar.set_style(style);
    loop {
        let status = progress.ops.get();
        bar.set_length(progress.bytes_total());
        bar.set_position(progress.bytes_done.get());
        bar.set_message(format!(
            "{}/{} files",
            status.finished,
            progress.files_total()
        ));
        match stop.recv_timeout(delay) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    bar.finish();
}

fn text_updates_loop(delay: std::time::Duration, stop: &std::sync::mpsc::Receiver<()>) {
    let mut printer = progress::ProgressPrinter::new(get_progress());
    loop {
        match stop.recv_timeout(delay) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                eprintln!("{}", printer.print());
            }
            _ => break,
        }
    }
}

struct ProgressTracker {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl ProgressTracker {
    fn start(settings: &ProgressSettings) -> anyhow::Result<Self> {
        let progress_type = match settings.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &settings.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .map_err(|error| anyhow::anyhow!("invalid progress delay {delay:?}: {error}"))?,
            None if progress_type == ProgressType::ProgressBar => {
                std::time::Duration::from_millis(200)
            }
            None => std::time::Duration::from_secs(10),
        };
        let (stop, receiver) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            if progress_type == ProgressType::ProgressBar {
                progress_bar_loop(delay, &receiver);
            } else {
                text_updates_loop(delay, &receiver);
            }
        });
        Ok(Self { stop, handle })
    }

    fn finish(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("progress thread panicked");
        }
    }
}

/// Spreads `per_second` tokens over 10 refills a second where the rate allows it.
fn replenish_schedule(per_second: usize) -> (usize, std::time::Duration) {
    if per_second >= 10 {
        (per_second / 10, std::time::Duration::from_millis(100))
    } else {
        (per_second, std::time::Duration::from_secs(1))
    }
}

fn default_max_open_files() -> Option<usize> {
    match nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE) {
        // RLIM_INFINITY would overflow the semaphore
        Ok((soft, _)) => Some(usize::try_from(soft).unwrap_or(usize::MAX).min(1 << 20) / 10 * 8),
        Err(error) => {
            tracing::info!("failed reading the open files limit: {}", error);
            None
        }
    }
}

fn setup_throttle(runtime: &tokio::runtime::Runtime, config: &ThrottleConfig) {
    let max_open_files = config.max_open_files.or_else(default_max_open_files);
    if let Some(max_open_files) = max_open_files {
        tracing::debug!("limiting open files to {}", max_open_files);
        throttle::set_max_open_files(max_open_files);
    }
    if config.ops_throttle > 0 {
        let (tokens, interval) = replenish_schedule(config.ops_throttle);
        throttle::init_ops_tokens(tokens);
        runtime.spawn(throttle::run_ops_replenish_thread(tokens, interval));
    }
    if config.iops_throttle > 0 {
        let (tokens, interval) = replenish_schedule(config.iops_throttle);
        throttle::init_iops_tokens(tokens);
        runtime.spawn(throttle::run_iops_replenish_thread(tokens, interval));
    }
}

fn setup_tracing(output: &OutputConfig) {
    if output.quiet {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .try_init();
}

/// Runs `func` on a freshly configured tokio runtime.
///
/// Returns `None` when setup or `func` failed; the error has already been reported.
pub fn run<Fut, Summary>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    setup_tracing(&output);
    let report = |error: &anyhow::Error| {
        if !output.quiet {
            eprintln!("{error:#}");
        }
    };
    if let Err(error) = throttle.validate() {
        report(&anyhow::anyhow!(error));
        return None;
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            report(&anyhow::Error::new(error).context("failed to start the tokio runtime"));
            return None;
        }
    };
    setup_throttle(&tokio_runtime, &throttle);
    let tracker = match progress.as_ref().map(ProgressTracker::start).transpose() {
        Ok(tracker) => tracker,
        Err(error) => {
            report(&error);
            return None;
        }
    };
    let result = tokio_runtime.block_on(func());
    if let Some(tracker) = tracker {
        tracker.finish();
    }
    tokio_runtime.shutdown_background();
    match result {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            report(&error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replenish_rates() {
        assert_eq!(
            replenish_schedule(500),
            (50, std::time::Duration::from_millis(100))
        );
        assert_eq!(replenish_schedule(3), (3, std::time::Duration::from_secs(1)));
    }

    #[test]
    fn run_reports_success_and_failure() {
        let output = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        let ok = run(
            None,
            output,
            RuntimeConfig::default(),
            ThrottleConfig {
                max_open_files: Some(0),
                ..Default::default()
            },
            || async { Ok::<_, anyhow::Error>(7) },
        );
        assert_eq!(ok, Some(7));
        let failed: Option<u32> = run(
            None,
            output,
            RuntimeConfig::default(),
            ThrottleConfig {
                max_open_files: Some(0),
                ..Default::default()
            },
            || async { Err(anyhow::anyhow!("boom")) },
        );
        assert!(failed.is_none());
    }

    #[test]
    fn invalid_throttle_config_fails_fast() {
        let result = run(
            None,
            OutputConfig {
                quiet: true,
                ..Default::default()
            },
            RuntimeConfig::default(),
            ThrottleConfig {
                iops_throttle: 10,
                ..Default::default()
            },
            || async { Ok::<_, anyhow::Error>(1) },
        );
        assert!(result.is_none());
    }
}
