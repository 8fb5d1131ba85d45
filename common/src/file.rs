//! Files, listings and destination path mapping.
//!
//! Paths are backend-relative strings with `/` separators; the helpers below never touch the
//! local filesystem so they work the same for every backend.

use std::sync::Arc;

use crate::client::{Client, Entry, FileInfo};
use crate::error::{Error, Result};

/// Last segment of `path`, ignoring a trailing separator.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Everything before the last segment of `path`; `/` for top-level entries.
pub fn parent_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

pub fn join_path(base: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return base.to_string();
    }
    if base.is_empty() {
        return relative.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// Hidden entries start with `.`; the current-directory markers are not hidden.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != "./"
}

/// One object on one backend.
///
/// `size` and `is_dir` are only authoritative right after the stat or listing that produced them.
#[derive(Clone)]
pub struct File {
    pub path: String,
    pub size: i64,
    pub is_dir: bool,
    pub is_link: bool,
    pub exists: bool,
    /// Display identifier assigned by the orchestrator, e.g. `[3/10] name`.
    pub id: String,
    pub md5: Option<String>,
    client: Arc<dyn Client>,
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("client", &self.client.kind())
            .field("path", &self.path)
            .field("size", &self.size)
            .field("is_dir", &self.is_dir)
            .field("exists", &self.exists)
            .finish()
    }
}

impl File {
    pub fn from_entry(client: Arc<dyn Client>, entry: Entry) -> Self {
        Self::from_info(client, entry.path, Some(entry.info))
    }

    fn from_info(client: Arc<dyn Client>, path: String, info: Option<FileInfo>) -> Self {
        let exists = info.is_some();
        let info = info.unwrap_or_default();
        Self {
            path,
            size: info.size,
            is_dir: info.is_dir,
            is_link: info.is_link,
            exists,
            id: String::new(),
            md5: None,
            client,
        }
    }

    /// Stats `path`; a missing object yields a non-existing file of size 0.
    pub async fn open(client: Arc<dyn Client>, path: &str) -> Result<Self> {
        match client.stat(path).await {
            Ok(info) => Ok(Self::from_info(client, path.to_string(), Some(info))),
            Err(error) if error.is_not_found() => Ok(Self::from_info(client, path.to_string(), None)),
            Err(error) => Err(error),
        }
    }

    /// Like [`File::open`] but any stat failure leaves the file empty and non-existing.
    pub async fn probe(client: Arc<dyn Client>, path: &str) -> Self {
        match client.stat(path).await {
            Ok(info) => Self::from_info(client, path.to_string(), Some(info)),
            Err(error) => {
                if !error.is_not_found() {
                    tracing::debug!("failed probing {:?}, treating as absent: {:#}", path, &error);
                }
                Self::from_info(client, path.to_string(), None)
            }
        }
    }

    pub fn name(&self) -> &str {
        base_name(&self.path)
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    /// Computes and stores the content fingerprint.
    pub async fn fingerprint(&mut self) -> Result<&str> {
        let md5 = self.client.md5(&self.path, self.size).await?;
        Ok(self.md5.insert(md5))
    }

    /// Destination path for this file, discovered under `source_root`, when copied to
    /// `target_root`.
    ///
    /// A single-file source is relativized against its containing directory, a directory source
    /// against itself. When the source is a single file and the target's last segment equals the
    /// file name, the target is taken verbatim as an explicit rename.
    pub fn target_path(&self, source_root: &File, target_root: &File) -> String {
        let base = if source_root.is_dir {
            source_root.path.as_str()
        } else {
            if base_name(&target_root.path) == self.name() {
                return target_root.path.clone();
            }
            parent_path(&source_root.path)
        };
        let relative = self.path.strip_prefix(base).unwrap_or(&self.path);
        join_path(&target_root.path, relative.trim_start_matches('/'))
    }

    /// Maps this file under `target_root` and probes the destination's current state.
    pub async fn target(&self, source_root: &File, target_root: &File) -> File {
        let path = self.target_path(source_root, target_root);
        File::probe(target_root.client.clone(), &path).await
    }
}

/// Files produced by one enumeration, in traversal order, plus their byte total.
#[derive(Debug, Default)]
pub struct FileList {
    pub files: Vec<File>,
    pub total: u64,
}

impl FileList {
    pub async fn collect(root: &File, skip_hidden: bool) -> Result<Self> {
        if !root.exists {
            return Err(Error::not_found(root.path.clone()));
        }
        let entries = root.client.list_files(&root.path, skip_hidden).await?;
        let mut list = FileList::default();
        for entry in entries {
            list.total += u64::try_from(entry.info.size).unwrap_or(0);
            list.files.push(File::from_entry(root.client.clone(), entry));
        }
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
