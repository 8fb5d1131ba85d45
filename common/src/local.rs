//! Local filesystem backend.
//!
//! Stateless: every call goes straight to `tokio::fs`, so the client is freely shared between
//! workers. Open files are bounded by the process-wide [`throttle::open_file_permit`] limit.

use anyhow::Context;
use async_recursion::async_recursion;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use crate::error::{Result, from_io};
use crate::file::is_hidden;

#[derive(Debug, Default)]
pub struct LocalClient {}

impl LocalClient {
    pub fn new() -> Self {
        Self {}
    }
}

/// Keeps the open-file permit alive for as long as the reader is.
struct PermitReader {
    inner: tokio::fs::File,
    _permit: throttle::OpenFileGuard,
}

impl tokio::io::AsyncRead for PermitReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

fn file_info(metadata: &std::fs::Metadata, link_target: Option<String>) -> FileInfo {
    FileInfo {
        size: i64::try_from(metadata.len()).unwrap_or(i64::MAX),
        is_dir: metadata.is_dir(),
        is_link: link_target.is_some(),
        modified: metadata.modified().ok(),
        link_target,
    }
}

#[async_recursion]
async fn walk(dir: &std::path::Path, skip_hidden: bool, entries: &mut Vec<Entry>) -> Result<()> {
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|error| from_io(error, &dir.to_string_lossy(), "reading directory"))?;
    let mut children = vec![];
    while let Some(child) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("failed traversing {dir:?}"))?
    {
        children.push(child.path());
    }
    // deterministic traversal order for progress numbering
    children.sort();
    for child in children {
        let name = child.file_name().map(|name| name.to_string_lossy().into_owned());
        if skip_hidden && name.as_deref().is_some_and(is_hidden) {
            tracing::debug!("skipping hidden entry {:?}", &child);
            continue;
        }
        let link = tokio::fs::symlink_metadata(&child)
            .await
            .with_context(|| format!("failed reading metadata of {child:?}"))?;
        if link.is_dir() {
            walk(&child, skip_hidden, entries).await?;
            continue;
        }
        let (metadata, link_target) = if link.is_symlink() {
            let target = tokio::fs::read_link(&child)
                .await
                .with_context(|| format!("failed reading link {child:?}"))?;
            match tokio::fs::metadata(&child).await {
                Ok(metadata) if metadata.is_file() => {
                    (metadata, Some(target.to_string_lossy().into_owned()))
                }
                Ok(_) => {
                    tracing::debug!("not following directory symlink {:?}", &child);
                    continue;
                }
                Err(error) => {
                    tracing::warn!("skipping dangling symlink {:?}: {}", &child, error);
                    continue;
                }
            }
        } else {
            (link, None)
        };
        entries.push(Entry {
            path: child.to_string_lossy().into_owned(),
            info: file_info(&metadata, link_target),
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl Client for LocalClient {
    fn kind(&self) -> ClientKind {
        ClientKind::Local
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: true,
            local: true,
        }
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    #[instrument]
    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let link = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|error| from_io(error, path, "reading metadata of"))?;
        if !link.is_symlink() {
            return Ok(file_info(&link, None));
        }
        let target = tokio::fs::read_link(path)
            .await
            .with_context(|| format!("failed reading link {path:?}"))?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|error| from_io(error, path, "following link"))?;
        Ok(file_info(
            &metadata,
            Some(target.to_string_lossy().into_owned()),
        ))
    }

    #[instrument]
    async fn mkdir(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .with_context(|| format!("failed creating directory {path:?}"))?;
        Ok(())
    }

    #[instrument]
    async fn list_files(&self, root: &str, skip_hidden: bool) -> Result<Vec<Entry>> {
        let info = self.stat(root).await?;
        if !info.is_dir {
            return Ok(vec![Entry {
                path: root.to_string(),
                info,
            }]);
        }
        let mut entries = vec![];
        walk(std::path::Path::new(root), skip_hidden, &mut entries).await?;
        tracing::debug!("found {} files under {:?}", entries.len(), root);
        Ok(entries)
    }

    #[instrument]
    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        let permit = throttle::open_file_permit().await;
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|error| from_io(error, path, "opening"))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .with_context(|| format!("failed seeking {path:?} to {offset}"))?;
        }
        Ok(Box::new(PermitReader {
            inner: file,
            _permit: permit,
        }))
    }

    #[instrument(skip(reader))]
    async fn write_at(&self, mut reader: BoxReader, path: &str, truncate: bool) -> Result<u64> {
        let _permit = throttle::open_file_permit().await;
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let mut file = options
            .open(path)
            .await
            .with_context(|| format!("failed opening {path:?} for writing"))?;
        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .with_context(|| format!("failed writing {path:?}"))?;
        file.flush()
            .await
            .with_context(|| format!("failed flushing {path:?}"))?;
        Ok(written)
    }

    #[instrument]
    async fn remove(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|error| from_io(error, path, "removing"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn stat_and_exists() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let client = LocalClient::new();
        let foo = tmp_dir.join("foo");
        let info = client.stat(foo.to_str().unwrap()).await?;
        assert!(info.is_dir);
        let info = client.stat(foo.join("0.txt").to_str().unwrap()).await?;
        assert_eq!(info.size, 1);
        assert!(!info.is_dir);
        let missing = foo.join("missing");
        let error = client.stat(missing.to_str().unwrap()).await.unwrap_err();
        assert!(error.is_not_found());
        assert!(!client.exists(missing.to_str().unwrap()).await);
        assert!(client.exists(foo.to_str().unwrap()).await);
        Ok(())
    }

    #[tokio::test]
    async fn list_single_file() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let client = LocalClient::new();
        let path = tmp_dir.join("foo").join("0.txt");
        let entries = client.list_files(path.to_str().unwrap(), false).await?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, path.to_str().unwrap());
        Ok(())
    }

    #[tokio::test]
    async fn list_tree_in_order() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let client = LocalClient::new();
        let foo = tmp_dir.join("foo");
        let entries = client.list_files(foo.to_str().unwrap(), false).await?;
        let relative: Vec<String> = entries
            .iter()
            .map(|entry| {
                entry
                    .path
                    .strip_prefix(foo.to_str().unwrap())
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(
            relative,
            vec![
                "/.hidden/secret.txt",
                "/.profile",
                "/0.txt",
                "/bar/1.txt",
                "/bar/2.txt",
                "/bar/3.txt",
                "/baz/4.txt",
                "/baz/5.txt",
            ]
        );
        let link = entries.iter().find(|entry| entry.path.ends_with("5.txt")).unwrap();
        assert!(link.info.is_link);
        assert_eq!(link.info.link_target.as_deref(), Some("../bar/2.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn list_skips_hidden() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let client = LocalClient::new();
        let foo = tmp_dir.join("foo");
        let entries = client.list_files(foo.to_str().unwrap(), true).await?;
        assert_eq!(entries.len(), 6);
        assert!(entries.iter().all(|entry| !entry.path.contains("/.")));
        Ok(())
    }

    #[tokio::test]
    async fn reader_honors_offset() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("data.txt");
        tokio::fs::write(&path, "0123456789").await?;
        let client = LocalClient::new();
        let mut reader = client.reader(path.to_str().unwrap(), 4).await?;
        let mut content = String::new();
        reader.read_to_string(&mut content).await?;
        assert_eq!(content, "456789");
        Ok(())
    }

    #[tokio::test]
    async fn write_truncate_and_append() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("out.txt");
        let path_str = path.to_str().unwrap();
        let client = LocalClient::new();
        client
            .write_at(Box::new(std::io::Cursor::new(b"hello".to_vec())), path_str, true)
            .await?;
        client
            .write_at(Box::new(std::io::Cursor::new(b" world".to_vec())), path_str, false)
            .await?;
        assert_eq!(tokio::fs::read_to_string(&path).await?, "hello world");
        let written = client
            .write_at(Box::new(std::io::Cursor::new(b"bye".to_vec())), path_str, true)
            .await?;
        assert_eq!(written, 3);
        assert_eq!(tokio::fs::read_to_string(&path).await?, "bye");
        Ok(())
    }

    #[tokio::test]
    async fn mkdir_and_mk_parent_are_idempotent() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let client = LocalClient::new();
        let nested = tmp_dir.join("a").join("b").join("c.txt");
        client.mk_parent(nested.to_str().unwrap()).await?;
        client.mk_parent(nested.to_str().unwrap()).await?;
        assert!(tmp_dir.join("a").join("b").is_dir());
        client.mkdir(tmp_dir.join("a").to_str().unwrap()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let client = LocalClient::new();
        let error = client
            .remove(tmp_dir.join("nope").to_str().unwrap())
            .await
            .unwrap_err();
        assert!(error.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn fingerprint_small_and_sampled() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let client = LocalClient::new();
        let small = tmp_dir.join("small.bin");
        tokio::fs::write(&small, b"hello").await?;
        assert_eq!(
            client.md5(small.to_str().unwrap(), 5).await?,
            crate::fingerprint::digest(b"hello")
        );
        let size = crate::fingerprint::FULL_HASH_LIMIT as usize + 4096;
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let large = tmp_dir.join("large.bin");
        tokio::fs::write(&large, &data).await?;
        let mut sample = data[..1000].to_vec();
        sample.extend_from_slice(&data[size - 1000..]);
        assert_eq!(
            client.md5(large.to_str().unwrap(), size as i64).await?,
            crate::fingerprint::digest(&sample)
        );
        Ok(())
    }
}
