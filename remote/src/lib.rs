//! Remote storage backends for xfer
//!
//! Every backend implements [`common::client::Client`]:
//!
//! - [`http::HttpClient`] talks to another xfer instance running in serving mode
//! - [`ftp::FtpClient`] drives a synchronous FTP session on the blocking thread pool
//! - [`sftp::SftpClient`] multiplexes an SFTP subsystem over an OpenSSH master connection
//! - [`s3::S3Client`] uses the AWS SDK with credentials from the shared profile files
//!
//! [`server`] holds the passive side: an axum router exposing any client over HTTP.
//!
//! # Connection strings
//!
//! ```text
//! file:///abs/path
//! http(s)://host[:port]/path[?proxy=socks5://proxy:1080]
//! ftp://[user[:pass]@]host[:port]/path
//! ssh://[user@]host[:port]/path
//! s3://profile[:access:secret]/prefix
//! ```
//!
//! [`connect`] picks the backend from the scheme, applies the proxy rules in [`proxy`] and
//! establishes the session before handing the client out.

use std::sync::Arc;

use common::address::{Endpoint, Scheme};
use common::client::Client;
use common::error::Error;
use common::local::LocalClient;
use tracing::instrument;

pub mod ftp;
pub mod http;
pub mod proxy;
pub mod s3;
pub mod server;
pub mod sftp;

pub const FTP_DEFAULT_PORT: u16 = 21;
pub const SSH_DEFAULT_PORT: u16 = 22;

/// Backend-independent knobs taken from the command line.
#[derive(Clone, Debug, Default)]
pub struct ConnectOptions {
    /// Overrides a `?proxy=` embedded in the connection string.
    pub proxy: Option<Endpoint>,
    /// S3 bucket; the first bucket of the account when unset.
    pub bucket: Option<String>,
    /// Private key for SSH authentication.
    pub identity_file: Option<std::path::PathBuf>,
    /// Forces whole-object writes on backends that would otherwise append.
    pub whole_object: bool,
}

fn effective_proxy(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Option<Endpoint>, Error> {
    if options.proxy.is_some() {
        return Ok(options.proxy.clone());
    }
    endpoint.query_proxy()
}

/// Builds the client for `endpoint` and connects it.
#[instrument(skip(options))]
pub async fn connect(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Arc<dyn Client>, Error> {
    let proxy = effective_proxy(endpoint, options)?;
    let client: Arc<dyn Client> = match endpoint.scheme {
        Scheme::File => {
            proxy::validate(common::client::ClientKind::Local, proxy.as_ref())?;
            Arc::new(LocalClient::new())
        }
        Scheme::Http | Scheme::Https => Arc::new(http::HttpClient::new(endpoint, proxy.as_ref())?),
        Scheme::Ftp => {
            proxy::validate(common::client::ClientKind::Ftp, proxy.as_ref())?;
            Arc::new(ftp::FtpClient::new(endpoint))
        }
        Scheme::Ssh => Arc::new(sftp::SftpClient::new(endpoint, proxy.as_ref(), options)?),
        Scheme::S3 => {
            proxy::validate(common::client::ClientKind::S3, proxy.as_ref())?;
            Arc::new(s3::S3Client::new(endpoint, options))
        }
        Scheme::Socks5 => {
            return Err(Error::config(format!(
                "{endpoint}: socks5 is only valid as a proxy"
            )));
        }
    };
    tracing::debug!("connecting {} client to {}", client.kind(), endpoint);
    client.connect().await?;
    Ok(client)
}
