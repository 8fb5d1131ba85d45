//! The capability contract every storage backend satisfies.
//!
//! The implementation set is closed: [`crate::local::LocalClient`] here, and the HTTP, FTP, SFTP
//! and S3 adapters in the `remote` crate. Backend-specific transfer rules are expressed through
//! [`ClientKind`] and [`Capabilities`] instead of downcasting.
//!
//! A client is shared by every worker operating on its side of the transfer, so all operations
//! take `&self`. Adapters whose session is not safe for concurrent use serialize internally and
//! say so in their module docs.

use crate::error::Result;

/// Byte stream handed from a source reader to a destination writer.
pub type BoxReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Variant tag, used by the orchestrator to apply backend-specific rules.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientKind {
    Local,
    HttpClient,
    HttpServer,
    Ftp,
    Sftp,
    S3,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Local => "local-client",
            ClientKind::HttpClient => "http-client",
            ClientKind::HttpServer => "http-server",
            ClientKind::Ftp => "ftp",
            ClientKind::Sftp => "sftp",
            ClientKind::S3 => "aws-s3",
        }
    }
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Positional append is supported; `false` means whole-object writes only.
    pub append: bool,
    /// The backend is the local filesystem of this process.
    pub local: bool,
}

/// Result of [`Client::stat`].
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub size: i64,
    pub is_dir: bool,
    #[serde(default)]
    pub is_link: bool,
    #[serde(default)]
    pub modified: Option<std::time::SystemTime>,
    #[serde(default)]
    pub link_target: Option<String>,
}

/// One object found by [`Client::list_files`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub path: String,
    #[serde(flatten)]
    pub info: FileInfo,
}

#[async_trait::async_trait]
pub trait Client: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ClientKind;

    fn capabilities(&self) -> Capabilities;

    /// Establishes the session. On error no usable session is left behind.
    async fn connect(&self) -> Result<()>;

    /// Releases the session; calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Transport failures are reported as "absent" after being logged.
    async fn exists(&self, path: &str) -> bool {
        match self.stat(path).await {
            Ok(_) => true,
            Err(error) if error.is_not_found() => false,
            Err(error) => {
                tracing::warn!("{}: cannot check {:?}, assuming absent: {:#}", self.kind(), path, &error);
                false
            }
        }
    }

    /// Fails with [`crate::error::Error::NotFound`] when the object is absent.
    async fn stat(&self, path: &str) -> Result<FileInfo>;

    /// No-op if the directory already exists.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Creates the parent directory of `path`.
    async fn mk_parent(&self, path: &str) -> Result<()> {
        let parent = crate::file::parent_path(path);
        if parent == "/" || parent.is_empty() {
            return Ok(());
        }
        self.mkdir(parent).await
    }

    /// A single file yields exactly itself; a directory yields every file below it, recursively.
    /// With `skip_hidden` any entry whose name starts with `.` is pruned, directories wholesale.
    async fn list_files(&self, root: &str, skip_hidden: bool) -> Result<Vec<Entry>>;

    /// Byte stream positioned at `offset`.
    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader>;

    /// Consumes `reader` into `path`, from byte 0 when `truncate` is set, otherwise appending.
    /// Returns the number of bytes written.
    async fn write_at(&self, reader: BoxReader, path: &str, truncate: bool) -> Result<u64>;

    /// Replaces the whole object. `size` is the expected length of the stream.
    async fn write(&self, reader: BoxReader, path: &str, size: u64) -> Result<u64> {
        let _ = size;
        self.write_at(reader, path, true).await
    }

    async fn remove(&self, path: &str) -> Result<()>;

    /// Content fingerprint of an object of `size` bytes, see [`crate::fingerprint`].
    async fn md5(&self, path: &str, size: i64) -> Result<String> {
        crate::fingerprint::compute(self, path, size).await
    }
}
