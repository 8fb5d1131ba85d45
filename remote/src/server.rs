//! Passive serving mode: exposes a client's tree over HTTP.
//!
//! Routes, all taking the object path as `?path=` relative to the served root:
//!
//! | route          | effect                                                        |
//! |----------------|---------------------------------------------------------------|
//! | `GET /list`    | JSON array of entries below the path (`&skipHidden=true`)     |
//! | `GET /stat`    | JSON object describing the path                               |
//! | `GET /md5`     | fingerprint of the path as hex text                           |
//! | `GET /file`    | file bytes, honoring `Range: bytes=N-`                        |
//! | `GET /post`    | current size of the path as text, `0` when absent             |
//! | `POST /post`   | stores the request body, `&mode=t` truncates, `&mode=a` appends |
//! | `POST /create` | creates the directory                                         |
//! | `POST /delete` | removes the file                                              |
//!
//! Paths containing `..` are refused with 403.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use common::client::{BoxReader, Capabilities, Client, ClientKind, Entry, FileInfo};
use common::error::{Error, Result};
use common::file::join_path;

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, thiserror::Error)]
#[error("{0:?} is outside the served root")]
pub struct OutsideRoot(String);

/// Confines every path to `root` on the wrapped client.
#[derive(Debug)]
pub struct ServedClient {
    inner: Arc<dyn Client>,
    root: String,
}

impl ServedClient {
    pub fn new(inner: Arc<dyn Client>, root: &str) -> Self {
        let root = if root.is_empty() { "/" } else { root };
        Self {
            inner,
            root: root.to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<String> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return Err(anyhow::Error::new(OutsideRoot(path.to_string())).into());
        }
        if relative.is_empty() {
            return Ok(self.root.clone());
        }
        Ok(join_path(&self.root, relative))
    }

    fn relativize(&self, path: &str) -> String {
        let root = self.root.trim_end_matches('/');
        match path.strip_prefix(root) {
            Some(rest) if rest.is_empty() => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => path.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Client for ServedClient {
    fn kind(&self) -> ClientKind {
        ClientKind::HttpServer
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        self.inner.stat(&self.resolve(path)?).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.mkdir(&self.resolve(path)?).await
    }

    async fn mk_parent(&self, path: &str) -> Result<()> {
        self.inner.mk_parent(&self.resolve(path)?).await
    }

    async fn list_files(&self, root: &str, skip_hidden: bool) -> Result<Vec<Entry>> {
        let entries = self
            .inner
            .list_files(&self.resolve(root)?, skip_hidden)
            .await?;
        Ok(entries
            .into_iter()
            .map(|entry| Entry {
                path: self.relativize(&entry.path),
                info: entry.info,
            })
            .collect())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<BoxReader> {
        self.inner.reader(&self.resolve(path)?, offset).await
    }

    async fn write_at(&self, reader: BoxReader, path: &str, truncate: bool) -> Result<u64> {
        self.inner
            .write_at(reader, &self.resolve(path)?, truncate)
            .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(&self.resolve(path)?).await
    }

    async fn md5(&self, path: &str, size: i64) -> Result<String> {
        self.inner.md5(&self.resolve(path)?, size).await
    }
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Other(error) if error.downcast_ref::<OutsideRoot>().is_some() => {
                StatusCode::FORBIDDEN
            }
            Error::Configuration(_) => StatusCode::BAD_REQUEST,
            error if error.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", &self.0);
        } else {
            tracing::debug!("request refused with {}: {}", status, &self.0);
        }
        (status, format!("{}", self.0)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathQuery {
    /// Empty means the served root.
    #[serde(default)]
    path: String,
    #[serde(default)]
    skip_hidden: bool,
    #[serde(default)]
    mode: Option<String>,
}

type AppState = Arc<ServedClient>;

async fn list(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<Json<Vec<Entry>>> {
    Ok(Json(client.list_files(&query.path, query.skip_hidden).await?))
}

async fn stat(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<Json<FileInfo>> {
    Ok(Json(client.stat(&query.path).await?))
}

async fn md5(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<String> {
    let info = client.stat(&query.path).await?;
    Ok(client.md5(&query.path, info.size).await?)
}

/// Parses `bytes=N-`; any other range form is served from the start.
fn range_offset(headers: &HeaderMap) -> u64 {
    headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.strip_suffix('-'))
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

async fn download(
    State(client): State<AppState>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let offset = range_offset(&headers);
    let reader = client.reader(&query.path, offset).await?;
    let status = if offset > 0 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let body = Body::from_stream(tokio_util::io::ReaderStream::new(reader));
    Ok((status, body).into_response())
}

async fn size(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<String> {
    match client.stat(&query.path).await {
        Ok(info) => Ok(info.size.to_string()),
        Err(error) if error.is_not_found() => Ok("0".to_string()),
        Err(error) => Err(error.into()),
    }
}

#[instrument(skip(client, body))]
async fn upload(
    State(client): State<AppState>,
    Query(query): Query<PathQuery>,
    body: Body,
) -> ApiResult<String> {
    let truncate = match query.mode.as_deref() {
        Some("t") | None => true,
        Some("a") => false,
        Some(other) => return Err(Error::config(format!("unknown write mode {other:?}")).into()),
    };
    client.mk_parent(&query.path).await?;
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let reader: BoxReader = Box::new(tokio_util::io::StreamReader::new(Box::pin(stream)));
    let written = client.write_at(reader, &query.path, truncate).await?;
    tracing::debug!("stored {} bytes into {:?}", written, &query.path);
    Ok(written.to_string())
}

async fn create(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<StatusCode> {
    client.mkdir(&query.path).await?;
    Ok(StatusCode::OK)
}

async fn delete(State(client): State<AppState>, Query(query): Query<PathQuery>) -> ApiResult<StatusCode> {
    client.remove(&query.path).await?;
    Ok(StatusCode::OK)
}

pub fn router(client: Arc<ServedClient>) -> Router {
    Router::new()
        .route("/list", get(list))
        .route("/stat", get(stat))
        .route("/md5", get(md5))
        .route("/file", get(download))
        .route("/post", get(size).post(upload))
        .route("/create", axum::routing::post(create))
        .route("/delete", axum::routing::post(delete))
        .with_state(client)
}

/// `host:port` to bind; a missing port means [`DEFAULT_PORT`].
pub fn bind_address(server: &str) -> Result<String> {
    let server = server
        .strip_prefix("http://")
        .unwrap_or(server)
        .trim_end_matches('/');
    if server.is_empty() {
        return Ok(format!("0.0.0.0:{DEFAULT_PORT}"));
    }
    let has_port = match server.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>()
                .map_err(|error| Error::config(format!("invalid server port {port:?}: {error}")))?;
            !host.is_empty()
        }
        None => false,
    };
    if has_port {
        Ok(server.to_string())
    } else if server.starts_with(':') {
        Ok(format!("0.0.0.0{server}"))
    } else {
        Ok(format!("{server}:{DEFAULT_PORT}"))
    }
}

/// Serves `client` on an already bound listener until `cancel` fires.
pub async fn serve_listener(
    listener: tokio::net::TcpListener,
    client: Arc<ServedClient>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("serving {:?} on http://{}", client.root(), addr);
    axum::serve(listener, router(client))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    tracing::info!("server on {} stopped", addr);
    Ok(())
}

pub async fn serve(
    bind: &str,
    inner: Arc<dyn Client>,
    root: &str,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| Error::connection(bind, error))?;
    serve_listener(listener, Arc::new(ServedClient::new(inner, root)), cancel).await
}
