//! Client side of the xfer HTTP protocol.
//!
//! The peer is another xfer process in serving mode, see [`crate::server`] for the routes.
//! Paths sent to the peer are relative to the root it serves; connection pooling is left to
//! reqwest, so the client is shared between workers without extra locking.

use anyhow::{Context, anyhow};
use futures::TryStreamExt;
use tracing::instrument;

use common::address::{Endpoint, Scheme};
use common::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use common::error::{Error, Result};

use crate::proxy;

#[derive(Debug)]
pub struct HttpClient {
    endpoint: Endpoint,
    base: url::Url,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(endpoint: &Endpoint, proxy_endpoint: Option<&Endpoint>) -> Result<Self> {
        let default_port = if endpoint.scheme == Scheme::Https { 443 } else { 80 };
        let base = url::Url::parse(&format!(
            "{}://{}/",
            endpoint.scheme,
            endpoint.addr(default_port)
        ))
        .map_err(|error| Error::config(format!("invalid http endpoint {endpoint}: {error}")))?;
        let mut builder = reqwest::Client::builder();
        if let Some(proxy_endpoint) = proxy::validate(ClientKind::HttpClient, proxy_endpoint)? {
            tracing::debug!("routing http traffic through {}", proxy_endpoint);
            let proxy_url = proxy::proxy_url(proxy_endpoint)?;
            let proxy = reqwest::Proxy::all(proxy_url.as_str()).map_err(|error| {
                Error::config(format!("invalid proxy {proxy_endpoint}: {error}"))
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|error| Error::config(format!("failed to build http client: {error}")))?;
        Ok(Self {
            endpoint: endpoint.clone(),
            base,
            client,
        })
    }

    fn url(&self, route: &str) -> Result<url::Url> {
        self.base
            .join(route)
            .with_context(|| format!("invalid route {route:?}"))
            .map_err(Error::from)
    }

    async fn get(&self, route: &str, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(self.url(route)?)
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("GET /{route} {path:?} failed"))?;
        check(response, path).await
    }

    async fn post(&self, route: &str, path: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url(route)?)
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("POST /{route} {path:?} failed"))?;
        check(response, path).await
    }

    /// Current size of `path` on the peer, 0 when absent.
    pub async fn size(&self, path: &str) -> Result<u64> {
        let text = self
            .get("post", path)
            .await?
            .text()
            .await
            .with_context(|| format!("failed reading size of {path:?}"))?;
        text.trim()
            .parse()
            .with_context(|| format!("peer returned an invalid size for {path:?}: {text:?}"))
            .map_err(Error::from)
    }
}

/// Maps the peer's status codes back onto the error taxonomy.
async fn check(response: reqwest::Response, path: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::not_found(path));
    }
    let body = response.text().await.unwrap_or_default();
    Err(anyhow!("peer answered {} for {:?}: {}", status, path, body.trim()).into())
}

#[async_trait::async_trait]
impl Client for HttpClient {
    fn kind(&self) -> ClientKind {
        ClientKind::HttpClient
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            append: true,
            local: false,
        }
    }

    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn connect(&self) -> Result<()> {
        match self.stat("/").await {
            Ok(_) => Ok(()),
            Err(error) => Err(Error::connection(&self.endpoint, anyhow!("{error:#}"))),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.get("stat", path)
            .await?
            .json()
            .await
            .with_context(|| format!("invalid stat response for {path:?}"))
            .map_err(Error::from)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.post("create", path).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_files(&self, root: &str, skip_hidden: bool) -> Result<Vec<Entry>> {
        let skip_hidden = skip_hidden.to_string();
        let response = self
            .client
            .get(self.url("list")?)
            .query(&[("path", root), ("skipHidden", skip_hidden.as_str())])
            .send()
            .await
            .with_context(|| format!("GET /list {root:?} failed"))?;
        check(response, root)
            .await?
            .json()
            .await
            .with_context(|| format!("invalid listing for {root:?}"))
            .map_err(Error::from)
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        let mut request = self.client.get(self.url("file")?).query(&[("path", path)]);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET /file {path:?} failed"))?;
        let response = check(response, path).await?;
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(tokio_util::io::StreamReader::new(Box::pin(stream))))
    }

    #[instrument(skip(self, reader))]
    async fn write_at(&self, reader: BoxReader, path: &str, truncate: bool) -> Result<u64> {
        if !truncate {
            tracing::debug!("appending to {:?} at {}", path, self.size(path).await?);
        }
        let mode = if truncate { "t" } else { "a" };
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(reader));
        let response = self
            .client
            .post(self.url("post")?)
            .query(&[("path", path), ("mode", mode)])
            .body(body)
            .send()
            .await
            .map_err(|error| Error::transfer(path, error))?;
        let text = check(response, path)
            .await?
            .text()
            .await
            .map_err(|error| Error::transfer(path, error))?;
        text.trim()
            .parse()
            .with_context(|| format!("peer returned an invalid byte count: {text:?}"))
            .map_err(Error::from)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.post("delete", path).await?;
        Ok(())
    }

    /// Computed by the peer next to the data.
    async fn md5(&self, path: &str, _size: i64) -> Result<String> {
        let text = self
            .get("md5", path)
            .await?
            .text()
            .await
            .with_context(|| format!("failed reading fingerprint of {path:?}"))?;
        Ok(text.trim().to_string())
    }
}
