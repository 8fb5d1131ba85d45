//! Resumable file transfer between local disk, HTTP, FTP, SFTP and S3 - the `xfer` tool
//!
//! `xfer` copies a file or a directory tree from one location to another. Either side may be a
//! local path or a connection string:
//!
//! ```bash
//! # upload a directory over SFTP with 4 workers
//! xfer /data/photos ssh://alice@backup.local/srv/photos -n 4 --progress
//!
//! # download from an FTP server through the default anonymous login
//! xfer ftp://mirror.local/pub/iso ./iso --summary
//!
//! # push to S3 using the "backup" profile from ~/.aws/config
//! xfer /data/archive s3://backup/archive --bucket nightly
//! ```
//!
//! Interrupted transfers are resumed: every file is compared with what the destination already
//! holds (size, then an MD5 fingerprint) and only the missing tail is streamed. A destination
//! larger than its source is deleted and copied again.
//!
//! # Serving mode
//!
//! Without a target, `xfer` exposes the source over HTTP so that another `xfer` can read from
//! or write to it through an `http://` connection string:
//!
//! ```bash
//! xfer /srv/share --server :8000
//! xfer ./local-dir http://fileserver:8000/incoming
//! ```
//!
//! # Daemon mode
//!
//! `--daemon` repeats the transfer every day at `--daemon-at HH:MM` (local time).
//!
//! # Modules
//!
//! - [`location`]: validation and normalization of command line locations
//! - [`orchestrator`]: connects both sides and runs a transfer, or serves the source
//! - [`schedule`]: daily re-runs for daemon mode

pub mod location;
pub mod orchestrator;
pub mod schedule;
