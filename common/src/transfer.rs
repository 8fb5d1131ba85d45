//! Transfer orchestrator: enumerates the source, dispatches every file to a fixed pool of
//! workers and drains the queue.
//!
//! Each worker maps its file under the target root, runs the resume decision from
//! [`crate::resume`] and streams the bytes. A failing file is logged and counted; the run moves
//! on to the next one. The queue is filled completely before it is closed, and no file is ever
//! handed to more than one worker.
//!
//! Cancellation is cooperative: workers stop taking files once the token fires and abandon the
//! copy in flight, leaving a partial destination that the next run resumes.

use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::{BoxReader, Client, ClientKind};
use crate::error::Error as ClientError;
use crate::file::{File, FileList};
use crate::progress::Progress;
use crate::resume::{self, Action, State};

/// Error returned when the run as a whole fails, with the partial summary of what was done.
///
/// # Logging Convention
/// Use `{:#}` or `{:?}` to get the full error chain:
/// ```ignore
/// tracing::error!("transfer failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Number of workers, at least 1.
    pub concurrency: usize,
    pub skip_hidden: bool,
    /// Chunk size used to charge I/O throttle tokens per file (0 disables).
    pub chunk_size: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            skip_hidden: false,
            chunk_size: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_transferred: u64,
    pub files_transferred: usize,
    pub files_resumed: usize,
    pub files_restarted: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
}

impl Summary {
    /// Files a worker picked up, whatever the outcome.
    pub fn files_attempted(&self) -> usize {
        self.files_transferred + self.files_skipped + self.files_failed
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred + other.bytes_transferred,
            files_transferred: self.files_transferred + other.files_transferred,
            files_resumed: self.files_resumed + other.files_resumed,
            files_restarted: self.files_restarted + other.files_restarted,
            files_skipped: self.files_skipped + other.files_skipped,
            files_failed: self.files_failed + other.files_failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes transferred: {}\n\
            files transferred: {}\n\
            files resumed: {}\n\
            files restarted: {}\n\
            files skipped: {}\n\
            files failed: {}",
            bytesize::ByteSize(self.bytes_transferred),
            self.files_transferred,
            self.files_resumed,
            self.files_restarted,
            self.files_skipped,
            self.files_failed,
        )
    }
}

/// Only local<->remote pairs are supported, plus sftp<->sftp.
pub fn check_pairing(source: &dyn Client, target: &dyn Client) -> Result<(), ClientError> {
    if source.capabilities().local || target.capabilities().local {
        return Ok(());
    }
    if source.kind() == ClientKind::Sftp && target.kind() == ClientKind::Sftp {
        return Ok(());
    }
    Err(ClientError::config(format!(
        "cannot transfer from {} to {}: one side must be local",
        source.kind(),
        target.kind()
    )))
}

/// Counts streamed bytes into the shared progress as they pass through.
struct CountingReader {
    inner: BoxReader,
    progress: &'static Progress,
}

impl tokio::io::AsyncRead for CountingReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = std::pin::Pin::new(&mut self.inner).poll_read(cx, buf);
        let read = (buf.filled().len() - before) as u64;
        if read > 0 {
            self.progress.bytes_transferred.add(read);
            self.progress.bytes_done.add(read);
        }
        result
    }
}

#[derive(Debug)]
struct Roots {
    source: File,
    target: File,
    settings: Settings,
}

#[instrument(skip(roots, progress), fields(id = %file.id))]
async fn transfer_file(
    roots: &Roots,
    mut file: File,
    progress: &'static Progress,
) -> Result<Summary, ClientError> {
    throttle::get_ops_token().await;
    let mut target = file.target(&roots.source, &roots.target).await;
    tracing::debug!("{:?} -> {:?}", &file.path, &target.path);
    if resume::needs_fingerprints(
        &State {
            exists: true,
            size: file.size,
            md5: None,
        },
        &State {
            exists: target.exists,
            size: target.size,
            md5: None,
        },
    ) {
        if let Err(error) = file.fingerprint().await {
            tracing::debug!("no source fingerprint for {:?}: {:#}", &file.path, &error);
        } else if let Err(error) = target.fingerprint().await {
            tracing::debug!("no target fingerprint for {:?}: {:#}", &target.path, &error);
        }
    }
    let append = target.client().capabilities().append;
    let action = resume::decide(
        &State {
            exists: true,
            size: file.size,
            md5: file.md5.as_deref(),
        },
        &State {
            exists: target.exists,
            size: target.size,
            md5: target.md5.as_deref(),
        },
        append,
    );
    tracing::debug!("action: {:?}", &action);
    let source_size = u64::try_from(file.size).unwrap_or(0);
    let mut summary = Summary::default();
    let (offset, truncate) = match action {
        Action::Skip => {
            tracing::info!("{} is up to date", &target.path);
            progress.bytes_done.add(source_size);
            progress.files_skipped.inc();
            summary.files_skipped = 1;
            return Ok(summary);
        }
        Action::Restart => {
            let corruption = ClientError::Corruption {
                path: target.path.clone(),
                source_size: file.size,
                destination_size: target.size,
            };
            tracing::warn!("{}, restarting", &corruption);
            if let Err(error) = target.client().remove(&target.path).await {
                return Err(ClientError::transfer(
                    target.path.clone(),
                    anyhow!("{}; failed removing it: {:#}", corruption, error),
                ));
            }
            progress.files_restarted.inc();
            summary.files_restarted = 1;
            (0, true)
        }
        Action::Copy { offset, truncate } => {
            if offset > 0 {
                tracing::info!("resuming {:?} from {}", &target.path, offset);
                progress.bytes_done.add(offset);
                progress.files_resumed.inc();
                summary.files_resumed = 1;
            }
            (offset, truncate)
        }
    };
    if !target.exists {
        target.client().mk_parent(&target.path).await.map_err(|error| {
            ClientError::transfer(
                target.path.clone(),
                anyhow!("failed creating parent directory: {:#}", error),
            )
        })?;
    }
    throttle::get_file_iops_tokens(roots.settings.chunk_size, source_size.saturating_sub(offset)).await;
    let reader = file.client().reader(&file.path, offset).await?;
    let reader: BoxReader = Box::new(CountingReader {
        inner: reader,
        progress,
    });
    let written = if append {
        target.client().write_at(reader, &target.path, truncate).await
    } else {
        target.client().write(reader, &target.path, source_size).await
    }
    .map_err(|error| ClientError::transfer(target.path.clone(), error))?;
    let info = target.client().stat(&target.path).await?;
    if info.size != file.size {
        return Err(ClientError::transfer(
            target.path.clone(),
            anyhow!(
                "size mismatch after copy: source has {} bytes, destination {}",
                file.size,
                info.size
            ),
        ));
    }
    progress.files_transferred.inc();
    summary.files_transferred = 1;
    summary.bytes_transferred = written;
    Ok(summary)
}

async fn worker(
    queue: async_channel::Receiver<File>,
    roots: Arc<Roots>,
    progress: &'static Progress,
    cancel: CancellationToken,
) -> Summary {
    let mut summary = Summary::default();
    while let Ok(file) = queue.recv().await {
        if cancel.is_cancelled() {
            break;
        }
        let _guard = progress.ops.guard();
        let id = file.id.clone();
        tracing::info!("{}", &id);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::warn!("{}: interrupted, partial data is kept for resuming", &id);
                break;
            }
            result = transfer_file(&roots, file, progress) => result,
        };
        match result {
            Ok(file_summary) => summary = summary + file_summary,
            Err(error) => {
                tracing::warn!("{}: {:#}", &id, &error);
                progress.files_failed.inc();
                summary.files_failed += 1;
            }
        }
    }
    summary
}

/// One source root copied to one target root.
#[derive(Debug)]
pub struct Transfer {
    source: File,
    target: File,
    settings: Settings,
}

impl Transfer {
    pub fn new(source: File, target: File, settings: Settings) -> Result<Self, ClientError> {
        if settings.concurrency == 0 {
            return Err(ClientError::config("concurrency must be at least 1"));
        }
        check_pairing(source.client().as_ref(), target.client().as_ref())?;
        Ok(Self {
            source,
            target,
            settings,
        })
    }

    pub fn source(&self) -> &File {
        &self.source
    }

    pub fn target(&self) -> &File {
        &self.target
    }

    #[instrument(skip(self, progress, cancel), fields(source = %self.source.path, target = %self.target.path))]
    pub async fn run(
        &self,
        progress: &'static Progress,
        cancel: CancellationToken,
    ) -> Result<Summary, Error> {
        tracing::info!("enumerating {:?}", &self.source.path);
        let files = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::new(anyhow!("cancelled while enumerating"), Summary::default()));
            }
            files = FileList::collect(&self.source, self.settings.skip_hidden) => files,
        }
        .map_err(|error| {
            Error::new(
                anyhow::Error::new(error).context(format!("failed listing {:?}", &self.source.path)),
                Summary::default(),
            )
        })?;
        let total = files.len();
        progress.add_totals(total as u64, files.total);
        tracing::info!(
            "dispatching {} files ({}) to {} workers",
            total,
            bytesize::ByteSize(files.total),
            self.settings.concurrency
        );
        let roots = Arc::new(Roots {
            source: self.source.clone(),
            target: self.target.clone(),
            settings: self.settings,
        });
        let (sender, receiver) = async_channel::unbounded();
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..self.settings.concurrency {
            join_set.spawn(worker(
                receiver.clone(),
                roots.clone(),
                progress,
                cancel.clone(),
            ));
        }
        drop(receiver);
        for (idx, mut file) in files.files.into_iter().enumerate() {
            file.id = format!("[{}/{}] {}", idx + 1, total, file.name());
            if sender.send(file).await.is_err() {
                // all workers are gone, only possible after cancellation
                break;
            }
        }
        sender.close();
        tracing::info!("draining");
        let mut summary = Summary::default();
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok(worker_summary) => summary = summary + worker_summary,
                Err(error) => tracing::error!("worker failed: {}", &error),
            }
        }
        tracing::info!(
            "done: {} transferred, {} skipped, {} failed",
            summary.files_transferred,
            summary.files_skipped,
            summary.files_failed
        );
        if cancel.is_cancelled() {
            return Err(Error::new(anyhow!("transfer cancelled"), summary));
        }
        if summary.files_failed > 0 && summary.files_failed == summary.files_attempted() {
            return Err(Error::new(
                anyhow!("all {} attempted files failed", summary.files_failed),
                summary,
            ));
        }
        Ok(summary)
    }
}
