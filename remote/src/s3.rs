//! S3-compatible object store backend.
//!
//! `s3://[access:secret@]profile/prefix`: the profile is read from the shared AWS config and
//! credentials files (credentials, region, `endpoint_url`); keys given in the connection string
//! replace the profile's credentials. Requests use path-style addressing so S3-compatible
//! stores work without virtual-host DNS.
//!
//! Objects are written whole. Directories exist only as key prefixes; `mkdir` leaves a
//! zero-byte `dir/` marker for tools that expect one.

use anyhow::anyhow;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::AsyncReadExt;
use tracing::instrument;

use common::address::Endpoint;
use common::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use common::error::{Error, Result};
use common::file::is_hidden;

use crate::ConnectOptions;

/// Objects above this size are uploaded in parts of this size.
pub const PART_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug)]
struct Connection {
    client: aws_sdk_s3::Client,
    bucket: String,
}

#[derive(Debug)]
pub struct S3Client {
    endpoint: Endpoint,
    profile: String,
    bucket: Option<String>,
    connection: tokio::sync::OnceCell<Connection>,
}

fn key(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn sdk_error<E>(error: E, path: &str, what: &str) -> Error
where
    E: std::error::Error,
{
    anyhow!("s3 {} {:?} failed: {}", what, path, DisplayErrorContext(error)).into()
}

/// A hidden segment anywhere below the listed prefix prunes the object.
fn has_hidden_segment(relative: &str) -> bool {
    relative.split('/').any(is_hidden)
}

fn to_system_time(time: &aws_sdk_s3::primitives::DateTime) -> Option<std::time::SystemTime> {
    std::time::SystemTime::try_from(*time).ok()
}

impl S3Client {
    pub fn new(endpoint: &Endpoint, options: &ConnectOptions) -> Self {
        Self {
            endpoint: endpoint.clone(),
            profile: endpoint.host.clone(),
            bucket: options.bucket.clone(),
            connection: tokio::sync::OnceCell::new(),
        }
    }

    async fn open(&self) -> anyhow::Result<Connection> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .profile_name(&self.profile);
        if let (Some(access), Some(secret)) = (&self.endpoint.username, &self.endpoint.password) {
            tracing::debug!("using credentials from the connection string");
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "connection-string",
            ));
        }
        let sdk_config = loader.load().await;
        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(config);
        let bucket = match &self.bucket {
            Some(bucket) => bucket.clone(),
            None => {
                let buckets = client
                    .list_buckets()
                    .send()
                    .await
                    .map_err(|error| anyhow!("failed to list buckets: {}", DisplayErrorContext(error)))?;
                let first = buckets
                    .buckets()
                    .iter()
                    .find_map(|bucket| bucket.name())
                    .ok_or_else(|| Error::config(format!("profile {:?} has no buckets", self.profile)))?;
                tracing::info!("no bucket given, using {:?}", first);
                first.to_string()
            }
        };
        client
            .head_bucket()
            .bucket(&bucket)
            .send()
            .await
            .map_err(|error| anyhow!("bucket {:?} is not accessible: {}", bucket, DisplayErrorContext(error)))?;
        Ok(Connection { client, bucket })
    }

    async fn connection(&self) -> Result<&Connection> {
        self.connection
            .get_or_try_init(|| async {
                self.open().await.map_err(|error| match error.downcast::<Error>() {
                    Ok(config @ Error::Configuration(_)) => config,
                    Ok(other) => Error::connection(&self.endpoint, anyhow!("{other:#}")),
                    Err(error) => Error::connection(&self.endpoint, error),
                })
            })
            .await
    }

    async fn is_prefix(&self, connection: &Connection, key: &str) -> Result<bool> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        let listing = connection
            .client
            .list_objects_v2()
            .bucket(&connection.bucket)
            .prefix(&prefix)
            .max_keys(1)
            .send()
            .await
            .map_err(|error| sdk_error(error, &prefix, "listing"))?;
        Ok(!listing.contents().is_empty() || listing.key_count().unwrap_or(0) > 0)
    }

    async fn put(&self, connection: &Connection, path: &str, body: Vec<u8>) -> Result<()> {
        connection
            .client
            .put_object()
            .bucket(&connection.bucket)
            .key(key(path))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|error| sdk_error(error, path, "upload"))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        connection: &Connection,
        reader: &mut BoxReader,
        path: &str,
        upload_id: &str,
    ) -> Result<(u64, Vec<CompletedPart>)> {
        let mut parts = vec![];
        let mut written = 0;
        for part_number in 1.. {
            let mut buffer = Vec::new();
            let read = (&mut *reader)
                .take(PART_SIZE)
                .read_to_end(&mut buffer)
                .await
                .map_err(|error| Error::transfer(path, error))?;
            if read == 0 && part_number > 1 {
                break;
            }
            let part = connection
                .client
                .upload_part()
                .bucket(&connection.bucket)
                .key(key(path))
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|error| sdk_error(error, path, "part upload"))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(part.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            written += read as u64;
            if (read as u64) < PART_SIZE {
                break;
            }
        }
        Ok((written, parts))
    }

    async fn multipart(&self, connection: &Connection, mut reader: BoxReader, path: &str) -> Result<u64> {
        let created = connection
            .client
            .create_multipart_upload()
            .bucket(&connection.bucket)
            .key(key(path))
            .send()
            .await
            .map_err(|error| sdk_error(error, path, "starting upload"))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::from(anyhow!("no upload id returned for {path:?}")))?
            .to_string();
        match self
            .upload_parts(connection, &mut reader, path, &upload_id)
            .await
        {
            Ok((written, parts)) => {
                connection
                    .client
                    .complete_multipart_upload()
                    .bucket(&connection.bucket)
                    .key(key(path))
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|error| sdk_error(error, path, "completing upload"))?;
                Ok(written)
            }
            Err(error) => {
                if let Err(abort) = connection
                    .client
                    .abort_multipart_upload()
                    .bucket(&connection.bucket)
                    .key(key(path))
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        "failed to abort upload of {:?}: {}",
                        path,
                        DisplayErrorContext(abort)
                    );
                }
                Err(error)
            }
        }
    }
}

#[async_trait::async_trait]
impl Client for S3Client {
    fn kind(&self) -> ClientKind {
        ClientKind::S3
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: false,
            local: false,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&self) -> Result<()> {
        let connection = self.connection().await?;
        tracing::debug!("connected to bucket {:?}", connection.bucket);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let connection = self.connection().await?;
        let object_key = key(path);
        if object_key.is_empty() {
            return Ok(FileInfo {
                is_dir: true,
                ..Default::default()
            });
        }
        match connection
            .client
            .head_object()
            .bucket(&connection.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(head) => Ok(FileInfo {
                size: head.content_length().unwrap_or(0),
                modified: head.last_modified().and_then(to_system_time),
                ..Default::default()
            }),
            Err(error) if error.as_service_error().is_some_and(|e| e.is_not_found()) => {
                if self.is_prefix(connection, object_key).await? {
                    Ok(FileInfo {
                        is_dir: true,
                        ..Default::default()
                    })
                } else {
                    Err(Error::not_found(path))
                }
            }
            Err(error) => Err(sdk_error(error, path, "stat")),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let object_key = key(path).trim_end_matches('/');
        if object_key.is_empty() {
            return Ok(());
        }
        let connection = self.connection().await?;
        self.put(connection, &format!("/{object_key}/"), vec![]).await
    }

    /// Keys need no parents.
    async fn mk_parent(&self, _path: &str) -> Result<()> {
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
        let connection = self.connection().await?;
        let root_key = key(root).trim_end_matches('/');
        let prefix = if root_key.is_empty() {
            String::new()
        } else {
            format!("{root_key}/")
        };
        let mut pages = connection
            .client
            .list_objects_v2()
            .bucket(&connection.bucket)
            .prefix(&prefix)
            .into_paginator()
            .send();
        let mut entries = vec![];
        while let Some(page) = pages.next().await {
            let page = page.map_err(|error| sdk_error(error, root, "listing"))?;
            for object in page.contents() {
                let Some(object_key) = object.key() else {
                    continue;
                };
                if object_key.ends_with('/') {
                    continue;
                }
                let relative = object_key.strip_prefix(&prefix).unwrap_or(object_key);
                if skip_hidden && has_hidden_segment(relative) {
                    tracing::debug!("skipping hidden object {:?}", object_key);
                    continue;
                }
                entries.push(Entry {
                    path: format!("/{object_key}"),
                    info: FileInfo {
                        size: object.size().unwrap_or(0),
                        modified: object.last_modified().and_then(to_system_time),
                        ..Default::default()
                    },
                });
            }
        }
        Ok(entries)
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        let connection = self.connection().await?;
        let mut request = connection
            .client
            .get_object()
            .bucket(&connection.bucket)
            .key(key(path));
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }
        let object = match request.send().await {
            Ok(object) => object,
            Err(error) if error.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(Error::not_found(path));
            }
            Err(error) => return Err(sdk_error(error, path, "download")),
        };
        Ok(Box::new(Box::pin(object.body.into_async_read())))
    }

    async fn write_at(&self, _reader: BoxReader, path: &str, _truncate: bool) -> Result<u64> {
        Err(Error::config(format!(
            "{path:?}: s3 objects can only be written whole"
        )))
    }

    #[instrument(skip(self, reader))]
    async fn write(&self, mut reader: BoxReader, path: &str, size: u64) -> Result<u64> {
        let connection = self.connection().await?;
        if size > PART_SIZE {
            return self.multipart(connection, reader, path).await;
        }
        let mut body = Vec::with_capacity(usize::try_from(size).unwrap_or(0));
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|error| Error::transfer(path, error))?;
        let written = body.len() as u64;
        self.put(connection, path, body).await?;
        Ok(written)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let connection = self.connection().await?;
        connection
            .client
            .delete_object()
            .bucket(&connection.bucket)
            .key(key(path))
            .send()
            .await
            .map_err(|error| sdk_error(error, path, "delete"))?;
        Ok(())
    }
}
