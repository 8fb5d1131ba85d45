//! SFTP backend.
//!
//! The system `ssh` binary establishes a master connection (host keys are accepted on first
//! use) and the SFTP subsystem is multiplexed over it, so concurrent workers share one
//! session. Authentication is whatever ssh would do on its own, plus an optional identity file.
//!
//! Proxies: an `ssh://` proxy becomes a jump host, a `socks5://` proxy a `ProxyCommand` in a
//! throwaway ssh config file.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use futures::TryStreamExt;
use openssh_sftp_client::error::SftpErrorKind;
use openssh_sftp_client::file::TokioCompatFile;
use openssh_sftp_client::metadata::MetaData;
use openssh_sftp_client::{Sftp, SftpOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use common::address::{Endpoint, Scheme};
use common::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use common::error::{Error, Result};
use common::file::{is_hidden, join_path};

use crate::{ConnectOptions, SSH_DEFAULT_PORT, proxy};

#[derive(Debug)]
enum Tunnel {
    None,
    JumpHost(String),
    /// Keeps the generated ssh config alive for the lifetime of the client.
    ProxyCommand(tempfile::NamedTempFile),
}

#[derive(Debug)]
pub struct SftpClient {
    endpoint: Endpoint,
    identity_file: Option<std::path::PathBuf>,
    whole_object: bool,
    tunnel: Tunnel,
    session: tokio::sync::Mutex<Option<Arc<Sftp>>>,
}

fn sftp_error(error: openssh_sftp_client::Error, path: &str, what: &str) -> Error {
    if let openssh_sftp_client::Error::SftpError(SftpErrorKind::NoSuchFile, _) = error {
        return Error::not_found(path);
    }
    anyhow::Error::new(error)
        .context(format!("sftp {what} {path:?} failed"))
        .into()
}

fn file_info(metadata: &MetaData) -> FileInfo {
    let file_type = metadata.file_type();
    FileInfo {
        size: metadata
            .len()
            .map_or(0, |len| i64::try_from(len).unwrap_or(i64::MAX)),
        is_dir: file_type.is_some_and(|file_type| file_type.is_dir()),
        is_link: file_type.is_some_and(|file_type| file_type.is_symlink()),
        modified: metadata.modified().map(|time| time.as_system_time()),
        link_target: None,
    }
}

fn socks_config(proxy: &Endpoint) -> Result<tempfile::NamedTempFile> {
    let mut config = tempfile::Builder::new()
        .prefix("xfer-ssh-")
        .suffix(".conf")
        .tempfile()
        .context("failed to create ssh config for the socks proxy")?;
    writeln!(
        config,
        "Host *\n    ProxyCommand nc -X 5 -x {} %h %p",
        proxy.addr(proxy::default_port(Scheme::Socks5))
    )
    .context("failed to write ssh config for the socks proxy")?;
    Ok(config)
}

impl SftpClient {
    pub fn new(
        endpoint: &Endpoint,
        proxy_endpoint: Option<&Endpoint>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let tunnel = match proxy::validate(ClientKind::Sftp, proxy_endpoint)? {
            None => Tunnel::None,
            Some(jump) if jump.scheme == Scheme::Ssh => {
                let host = jump.addr(SSH_DEFAULT_PORT);
                Tunnel::JumpHost(match &jump.username {
                    Some(user) => format!("{user}@{host}"),
                    None => host,
                })
            }
            Some(socks) => Tunnel::ProxyCommand(socks_config(socks)?),
        };
        if endpoint.password.is_some() {
            tracing::warn!("ssh passwords are not supported, using keys and agent for {}", endpoint);
        }
        Ok(Self {
            endpoint: endpoint.clone(),
            identity_file: options.identity_file.clone(),
            whole_object: options.whole_object,
            tunnel,
            session: tokio::sync::Mutex::new(None),
        })
    }

    /// Destination ssh would dial, for diagnostics.
    pub fn destination(&self) -> String {
        match &self.endpoint.username {
            Some(user) => format!("{}@{}", user, self.endpoint.addr(SSH_DEFAULT_PORT)),
            None => self.endpoint.addr(SSH_DEFAULT_PORT),
        }
    }

    async fn open_session(&self) -> anyhow::Result<Sftp> {
        let mut builder = openssh::SessionBuilder::default();
        builder
            .known_hosts_check(openssh::KnownHosts::Accept)
            .port(self.endpoint.port_or(SSH_DEFAULT_PORT));
        if let Some(user) = &self.endpoint.username {
            builder.user(user.clone());
        }
        if let Some(identity_file) = &self.identity_file {
            builder.keyfile(identity_file);
        }
        match &self.tunnel {
            Tunnel::None => {}
            Tunnel::JumpHost(jump) => {
                tracing::debug!("jumping through {}", jump);
                builder.jump_hosts([jump.as_str()]);
            }
            Tunnel::ProxyCommand(config) => {
                builder.config_file(config.path());
            }
        }
        tracing::debug!("connecting to ssh destination: {}", self.destination());
        let session = builder
            .connect(&self.endpoint.host)
            .await
            .context("failed to establish ssh connection")?;
        Sftp::from_session(session, SftpOptions::default())
            .await
            .context("failed to start the sftp subsystem")
    }

    async fn sftp(&self) -> Result<Arc<Sftp>> {
        let mut session = self.session.lock().await;
        if let Some(sftp) = session.as_ref() {
            return Ok(sftp.clone());
        }
        let sftp = Arc::new(
            self.open_session()
                .await
                .map_err(|error| Error::connection(&self.endpoint, error))?,
        );
        *session = Some(sftp.clone());
        Ok(sftp)
    }

    #[async_recursion::async_recursion]
    async fn walk(
        &self,
        sftp: &Sftp,
        dir: &str,
        skip_hidden: bool,
        entries: &mut Vec<Entry>,
    ) -> Result<()> {
        let listing = sftp
            .fs()
            .open_dir(dir)
            .await
            .map_err(|error| sftp_error(error, dir, "opening directory"))?;
        let mut children: Vec<_> = listing
            .read_dir()
            .try_collect()
            .await
            .map_err(|error| sftp_error(error, dir, "reading directory"))?;
        children.sort_by(|a, b| a.filename().cmp(b.filename()));
        for child in children {
            let name = child.filename().to_string_lossy().into_owned();
            if name == "." || name == ".." {
                continue;
            }
            let path = join_path(dir, &name);
            if skip_hidden && is_hidden(&name) {
                tracing::debug!("skipping hidden entry {:?}", &path);
                continue;
            }
            let mut info = file_info(&child.metadata());
            if info.is_link {
                match sftp.fs().metadata(path.as_str()).await {
                    Ok(target) if !file_info(&target).is_dir => {
                        info = FileInfo {
                            is_link: true,
                            ..file_info(&target)
                        };
                    }
                    Ok(_) => {
                        tracing::debug!("not following directory symlink {:?}", &path);
                        continue;
                    }
                    Err(error) => {
                        tracing::warn!("skipping dangling symlink {:?}: {}", &path, error);
                        continue;
                    }
                }
            }
            if info.is_dir {
                self.walk(sftp, &path, skip_hidden, entries).await?;
            } else {
                entries.push(Entry { path, info });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Client for SftpClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Sftp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: !self.whole_object,
            local: false,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&self) -> Result<()> {
        self.sftp().await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        let Some(sftp) = self.session.lock().await.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(sftp) {
            Ok(sftp) => sftp
                .close()
                .await
                .context("failed to close the sftp session")
                .map_err(Error::from),
            // readers still hold it; the session ends with the last of them
            Err(_) => Ok(()),
        }
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let sftp = self.sftp().await?;
        let mut fs = sftp.fs();
        let link = fs
            .symlink_metadata(path)
            .await
            .map_err(|error| sftp_error(error, path, "stat"))?;
        let info = file_info(&link);
        if !info.is_link {
            return Ok(info);
        }
        let target = fs
            .metadata(path)
            .await
            .map_err(|error| sftp_error(error, path, "stat"))?;
        let link_target = fs
            .read_link(path)
            .await
            .ok()
            .map(|target| target.to_string_lossy().into_owned());
        Ok(FileInfo {
            is_link: true,
            link_target,
            ..file_info(&target)
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        let mut fs = sftp.fs();
        let mut prefix = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            if let Err(error) = fs.create_dir(prefix.as_str()).await {
                match fs.metadata(prefix.as_str()).await {
                    Ok(metadata) if file_info(&metadata).is_dir => {}
                    _ => return Err(sftp_error(error, &prefix, "creating directory")),
                }
            }
        }
        Ok(())
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
        let sftp = self.sftp().await?;
        let mut entries = vec![];
        self.walk(&sftp, root, skip_hidden, &mut entries).await?;
        Ok(entries)
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        let sftp = self.sftp().await?;
        let file = sftp
            .open(path)
            .await
            .map_err(|error| sftp_error(error, path, "opening"))?;
        let mut file = Box::pin(TokioCompatFile::new(file));
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .with_context(|| format!("failed seeking {path:?} to {offset}"))?;
        }
        Ok(Box::new(file))
    }

    #[instrument(skip(self, reader))]
    async fn write_at(&self, mut reader: BoxReader, path: &str, truncate: bool) -> Result<u64> {
        let sftp = self.sftp().await?;
        // servers commonly ignore the append flag, so resume by seeking to the current end
        let offset = if truncate {
            0
        } else {
            match sftp.fs().metadata(path).await {
                Ok(metadata) => metadata.len().unwrap_or(0),
                Err(error) => match sftp_error(error, path, "stat") {
                    Error::NotFound(_) => 0,
                    other => return Err(other),
                },
            }
        };
        let file = sftp
            .options()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)
            .await
            .map_err(|error| sftp_error(error, path, "creating"))?;
        let mut file = Box::pin(TokioCompatFile::new(file));
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|error| Error::transfer(path, error))?;
        }
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|error| Error::transfer(path, error))?;
        file.flush()
            .await
            .map_err(|error| Error::transfer(path, error))?;
        Ok(written)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        sftp.fs()
            .remove_file(path)
            .await
            .map_err(|error| sftp_error(error, path, "removing"))
    }
}
