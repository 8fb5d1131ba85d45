//! FTP backend.
//!
//! suppaftp's session is synchronous and stateful, so every operation runs on the blocking pool
//! while holding the session lock. A download keeps the lock until its data stream is drained
//! or dropped; the bytes reach the async side through a bounded channel.
//!
//! A transport failure discards the session, the next operation reconnects.

use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::{Context, anyhow};
use suppaftp::types::{FileType, Response};
use suppaftp::{FtpError, FtpStream, Status};
use tracing::instrument;

use common::address::Endpoint;
use common::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use common::error::{Error, Result};
use common::file::{is_hidden, join_path};

use crate::FTP_DEFAULT_PORT;

const READ_CHUNK: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;

type Session = Arc<Mutex<Option<FtpStream>>>;

pub struct FtpClient {
    endpoint: Endpoint,
    session: Session,
}

impl std::fmt::Debug for FtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

fn is_unavailable(error: &FtpError) -> bool {
    matches!(
        error,
        FtpError::UnexpectedResponse(Response {
            status: Status::FileUnavailable,
            ..
        })
    )
}

fn open_session(endpoint: &Endpoint) -> anyhow::Result<FtpStream> {
    let addr = endpoint.addr(FTP_DEFAULT_PORT);
    let mut ftp =
        FtpStream::connect(addr.as_str()).with_context(|| format!("failed to dial {addr}"))?;
    let user = endpoint.username.as_deref().unwrap_or("anonymous");
    let password = endpoint.password.as_deref().unwrap_or("anonymous@");
    ftp.login(user, password)
        .with_context(|| format!("login as {user:?} refused"))?;
    ftp.transfer_type(FileType::Binary)
        .context("failed to switch to binary mode")?;
    tracing::debug!("ftp session to {} established", addr);
    Ok(ftp)
}

fn lock(session: &Session) -> Result<std::sync::MutexGuard<'_, Option<FtpStream>>> {
    session
        .lock()
        .map_err(|_| anyhow!("ftp session lock poisoned").into())
}

fn to_system_time(time: chrono::NaiveDateTime) -> std::time::SystemTime {
    time.and_utc().into()
}

fn stat_blocking(ftp: &mut FtpStream, path: &str) -> suppaftp::FtpResult<Option<FileInfo>> {
    match ftp.size(path) {
        Ok(size) => Ok(Some(FileInfo {
            size: i64::try_from(size).unwrap_or(i64::MAX),
            modified: ftp.mdtm(path).ok().map(to_system_time),
            ..Default::default()
        })),
        Err(error) if is_unavailable(&error) => match ftp.cwd(path) {
            Ok(()) => {
                ftp.cwd("/")?;
                Ok(Some(FileInfo {
                    is_dir: true,
                    ..Default::default()
                }))
            }
            Err(error) if is_unavailable(&error) => Ok(None),
            Err(error) => Err(error),
        },
        Err(error) => Err(error),
    }
}

fn walk_blocking(
    ftp: &mut FtpStream,
    dir: &str,
    skip_hidden: bool,
    entries: &mut Vec<Entry>,
) -> suppaftp::FtpResult<()> {
    let mut children: Vec<suppaftp::list::File> = vec![];
    for line in ftp.list(Some(dir))? {
        match line.parse::<suppaftp::list::File>() {
            Ok(file) => children.push(file),
            Err(error) => tracing::debug!("ignoring listing line {:?}: {}", line, error),
        }
    }
    children.sort_by(|a, b| a.name().cmp(b.name()));
    for child in children {
        let name = child.name();
        if name == "." || name == ".." {
            continue;
        }
        let path = join_path(dir, name);
        if skip_hidden && is_hidden(name) {
            tracing::debug!("skipping hidden entry {:?}", &path);
            continue;
        }
        if child.is_directory() {
            walk_blocking(ftp, &path, skip_hidden, entries)?;
        } else if child.is_symlink() {
            tracing::warn!("not following ftp symlink {:?}", &path);
        } else {
            entries.push(Entry {
                path,
                info: FileInfo {
                    size: i64::try_from(child.size()).unwrap_or(i64::MAX),
                    modified: Some(child.modified()),
                    ..Default::default()
                },
            });
        }
    }
    Ok(())
}

fn mkdir_blocking(ftp: &mut FtpStream, path: &str) -> suppaftp::FtpResult<()> {
    let mut prefix = String::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        if let Err(error) = ftp.mkdir(&prefix) {
            // already there
            if ftp.cwd(&prefix).is_err() {
                return Err(error);
            }
        }
    }
    ftp.cwd("/")
}

impl FtpClient {
    pub fn new(endpoint: &Endpoint) -> Self {
        Self {
            endpoint: endpoint.clone(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Runs `op` on the blocking pool with the session locked, reconnecting when needed.
    async fn with_session<T, F>(&self, path: &str, what: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream) -> suppaftp::FtpResult<T> + Send + 'static,
    {
        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&session)?;
            if guard.is_none() {
                *guard = Some(open_session(&endpoint).map_err(|error| Error::connection(&endpoint, error))?);
            }
            let ftp = guard
                .as_mut()
                .ok_or_else(|| Error::from(anyhow!("ftp session unavailable")))?;
            match op(ftp) {
                Ok(value) => Ok(value),
                Err(error) if is_unavailable(&error) => Err(Error::not_found(path)),
                Err(error) => {
                    if matches!(error, FtpError::ConnectionError(_)) {
                        tracing::warn!("dropping broken ftp session: {}", &error);
                        *guard = None;
                    }
                    Err(anyhow::Error::new(error)
                        .context(format!("ftp {what} {path:?} failed"))
                        .into())
                }
            }
        })
        .await
        .with_context(|| format!("ftp {what} task failed"))?
    }
}

#[async_trait::async_trait]
impl Client for FtpClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Ftp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: true,
            local: false,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&self) -> Result<()> {
        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        tokio::task::spawn_blocking(move || {
            let ftp = open_session(&endpoint).map_err(|error| Error::connection(&endpoint, error))?;
            *lock(&session)? = Some(ftp);
            Ok(())
        })
        .await
        .context("ftp connect task failed")?
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(mut ftp) = lock(&session)?.take() {
                if let Err(error) = ftp.quit() {
                    tracing::debug!("ftp quit failed: {}", error);
                }
            }
            Ok(())
        })
        .await
        .context("ftp close task failed")?
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let target = path.to_string();
        self.with_session(path, "stat", move |ftp| stat_blocking(ftp, &target))
            .await?
            .ok_or_else(|| Error::not_found(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let target = path.to_string();
        self.with_session(path, "mkdir", move |ftp| mkdir_blocking(ftp, &target))
            .await
    }

    #[instrument(skip(self))]
    async fn list_files(&self, root: &str, skip_hidden: bool) -> Result<Vec<Entry>> {
        let info = self.stat(root).await?;
        if !info.is_dir {
            return Ok(vec![Entry {
                path: root.to_string(),
                info,
            }]);
        }
        let dir = root.to_string();
        self.with_session(root, "listing", move |ftp| {
            let mut entries = vec![];
            walk_blocking(ftp, &dir, skip_hidden, &mut entries)?;
            Ok(entries)
        })
        .await
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        let offset = usize::try_from(offset).context("offset does not fit in memory")?;
        let (sender, receiver) = async_channel::bounded::<std::io::Result<bytes::Bytes>>(CHANNEL_DEPTH);
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();
        let session = self.session.clone();
        let endpoint = self.endpoint.clone();
        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = match lock(&session) {
                Ok(guard) => guard,
                Err(error) => {
                    let _ = ready_tx.send(Err(error));
                    return;
                }
            };
            if guard.is_none() {
                match open_session(&endpoint) {
                    Ok(ftp) => *guard = Some(ftp),
                    Err(error) => {
                        let _ = ready_tx.send(Err(Error::connection(&endpoint, error)));
                        return;
                    }
                }
            }
            let Some(ftp) = guard.as_mut() else {
                return;
            };
            let opened = if offset > 0 {
                ftp.resume_transfer(offset)
                    .and_then(|()| ftp.retr_as_stream(&path))
            } else {
                ftp.retr_as_stream(&path)
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(error) if is_unavailable(&error) => {
                    let _ = ready_tx.send(Err(Error::not_found(path)));
                    return;
                }
                Err(error) => {
                    let _ = ready_tx.send(Err(anyhow::Error::new(error)
                        .context(format!("ftp download {path:?} failed"))
                        .into()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let mut buffer = vec![0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buffer) {
                    Ok(0) => {
                        if let Err(error) = ftp.finalize_retr_stream(stream) {
                            let _ = sender.send_blocking(Err(std::io::Error::other(error)));
                        }
                        return;
                    }
                    Ok(read) => {
                        let chunk = bytes::Bytes::copy_from_slice(&buffer[..read]);
                        if sender.send_blocking(Ok(chunk)).is_err() {
                            // reader dropped before the end, e.g. a fingerprint sample
                            if let Err(error) = ftp.abort(stream) {
                                tracing::debug!("ftp abort failed, dropping the session: {}", error);
                                *guard = None;
                            }
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = sender.send_blocking(Err(error));
                        drop(stream);
                        *guard = None;
                        return;
                    }
                }
            }
        });
        ready_rx
            .await
            .context("ftp download task ended before opening the stream")??;
        Ok(Box::new(tokio_util::io::StreamReader::new(Box::pin(receiver))))
    }

    #[instrument(skip(self, reader))]
    async fn write_at(&self, reader: BoxReader, path: &str, truncate: bool) -> Result<u64> {
        // must be created on the runtime, it blocks on it from the pool thread
        let mut bridge = tokio_util::io::SyncIoBridge::new(reader);
        let target = path.to_string();
        self.with_session(path, "upload", move |ftp| {
            if truncate {
                ftp.put_file(&target, &mut bridge)
            } else {
                ftp.append_file(&target, &mut bridge)
            }
        })
        .await
        .map_err(|error| match error {
            Error::NotFound(_) | Error::Connection { .. } => error,
            other => Error::transfer(path, anyhow!("{other:#}")),
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let target = path.to_string();
        self.with_session(path, "remove", move |ftp| ftp.rm(&target))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_detection() {
        let error = FtpError::UnexpectedResponse(Response::new(
            Status::FileUnavailable,
            b"550 No such file".to_vec(),
        ));
        assert!(is_unavailable(&error));
        let error = FtpError::UnexpectedResponse(Response::new(
            Status::NotLoggedIn,
            b"530 Not logged in".to_vec(),
        ));
        assert!(!is_unavailable(&error));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_connection_error() {
        // nothing listens on the discard port of localhost in test environments
        let client = FtpClient::new(&Endpoint::parse("ftp://127.0.0.1:9/").unwrap());
        let error = client.connect().await.unwrap_err();
        assert!(matches!(error, Error::Connection { .. }));
    }

    #[test]
    fn debug_shows_the_endpoint_only() {
        let client = FtpClient::new(&Endpoint::parse("ftp://alice:pw@mirror.local/pub").unwrap());
        let shown = format!("{client:?}");
        assert!(shown.starts_with("FtpClient"), "{shown}");
        assert!(shown.contains("mirror.local"), "{shown}");
        assert!(!shown.contains("pw"), "{shown}");
    }
}
