use anyhow::Context;
use clap::Parser;
use tracing::instrument;

use xfer::orchestrator::{Job, cancel_on_ctrl_c};
use xfer::schedule;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "xfer",
    version,
    about = "Resumable file transfer between local disk, HTTP, FTP, SFTP and S3",
    long_about = "`xfer` copies a file or a directory tree between any two supported locations, resuming interrupted transfers.

Locations are either local paths or connection strings:
    file:///abs/path
    http(s)://host[:port]/path        (another xfer in serving mode)
    ftp://[user[:pass]@]host[:port]/path
    ssh://[user@]host[:port]/path
    s3://[access:secret@]profile/prefix

Without a TARGET the source is served over HTTP instead.

EXAMPLES:
    # Upload a directory over SFTP with 4 workers
    xfer /data/photos ssh://alice@backup.local/srv/photos -n 4 --progress

    # Download from FTP and print a summary
    xfer ftp://mirror.local/pub/iso ./iso --summary

    # Serve a directory on port 9000
    xfer /srv/share --server :9000

    # Mirror to S3 every night at 02:30
    xfer /data/archive s3://backup/archive --bucket nightly --daemon --daemon-at 02:30"
)]
struct Args {
    /// Source path or connection string
    #[arg(value_name = "SOURCE")]
    source: String,

    /// Target path or connection string; omit to serve SOURCE over HTTP
    #[arg(value_name = "TARGET")]
    target: Option<String>,

    // Transfer options
    /// Number of files transferred in parallel
    #[arg(
        short = 'n',
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Transfer options"
    )]
    concurrency: usize,

    /// Skip hidden files and do not descend into hidden directories
    #[arg(long, help_heading = "Transfer options")]
    skip_hidden: bool,

    /// Write every file as a whole object instead of appending to partial copies
    #[arg(long, visible_alias = "scp", help_heading = "Transfer options")]
    whole_object: bool,

    // Connection options
    /// Serve SOURCE over HTTP on this address, e.g. ":8000" or "0.0.0.0:9000"
    #[arg(long, value_name = "ADDR", help_heading = "Connection options")]
    server: Option<String>,

    /// Proxy for the network side: http(s)://, socks5:// or ssh://user@host:port (jump host)
    ///
    /// Takes precedence over a `?proxy=` embedded in a connection string.
    #[arg(long, value_name = "URI", help_heading = "Connection options")]
    proxy: Option<String>,

    /// S3 bucket; defaults to the first bucket of the account
    #[arg(long, value_name = "NAME", help_heading = "Connection options")]
    bucket: Option<String>,

    /// SSH private key used for ssh:// locations
    #[arg(short = 'i', long, value_name = "PATH", help_heading = "Connection options")]
    identity_file: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for the progress bar and 10s for text updates. If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files (0 = no limit, unspecified = 80% of system limit)
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of files started per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    /// Limit I/O operations per second (0 = no throttle)
    ///
    /// Requires --chunk-size to calculate I/O operations per file: ((`file_size` - 1) / `chunk_size`) + 1
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    /// Chunk size for calculating I/O operations per file
    ///
    /// Required when using --iops-throttle (must be > 0)
    #[arg(
        long,
        default_value = "0",
        value_name = "SIZE",
        help_heading = "Performance & throttling"
    )]
    chunk_size: bytesize::ByteSize,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // Daemon mode
    /// Repeat the transfer every day
    #[arg(long, help_heading = "Daemon mode")]
    daemon: bool,

    /// Local time of the daily run, HH:MM
    #[arg(
        long,
        default_value = "00:00",
        value_name = "HH:MM",
        help_heading = "Daemon mode"
    )]
    daemon_at: schedule::Daily,

    /// Wait for the first scheduled slot instead of running right away
    #[arg(long, help_heading = "Daemon mode")]
    daemon_wait: bool,
}

fn build_job(args: &Args) -> anyhow::Result<Job> {
    let proxy = args
        .proxy
        .as_deref()
        .map(common::address::Endpoint::parse)
        .transpose()
        .context("invalid --proxy")?;
    let connect = remote::ConnectOptions {
        proxy,
        bucket: args.bucket.clone(),
        identity_file: args.identity_file.clone(),
        whole_object: args.whole_object,
    };
    let settings = common::transfer::Settings {
        concurrency: args.concurrency,
        skip_hidden: args.skip_hidden,
        chunk_size: args.chunk_size.as_u64(),
    };
    tracing::debug!("transfer settings: {:?}", &settings);
    let mut job = Job::new(
        &args.source,
        args.target.as_deref(),
        args.server.as_deref(),
        connect,
        settings,
    )?;
    job.summary_on_error = args.summary;
    Ok(job)
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::transfer::Summary> {
    let job = build_job(&args)?;
    let cancel = cancel_on_ctrl_c();
    if !args.daemon {
        return job.run(cancel).await;
    }
    if job.target.is_none() {
        return Err(anyhow::anyhow!("--daemon requires a TARGET"));
    }
    tracing::info!("daemon mode, daily at {}", &args.daemon_at);
    schedule::run_daily(args.daemon_at, args.daemon_wait, cancel.clone(), || {
        let job = job.clone();
        let cancel = cancel.clone();
        // the bar and text updates describe the current daily run only
        common::get_progress().reset();
        async move { job.run(cancel).await }
    })
    .await
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
        iops_throttle: args.iops_throttle,
        chunk_size: args.chunk_size.as_u64(),
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
