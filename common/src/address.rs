//! Connection-string parsing.
//!
//! Every side of a transfer is described by a URI of the form
//! `scheme://[user[:password]@]host[:port][/path]`. Plain filesystem paths are normalized to
//! `file://<absolute-path>` by [`normalize_location`] before they reach [`Endpoint::parse`].
//!
//! The resolver is stateless: it never fills in backend default ports (that happens when a client
//! is constructed) and it never decides between a query-embedded proxy and a global one.

use anyhow::Context;

use crate::error::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    File,
    Http,
    Https,
    Ftp,
    Ssh,
    S3,
    /// Only meaningful for proxies.
    Socks5,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ftp => "ftp",
            Scheme::Ssh => "ssh",
            Scheme::S3 => "s3",
            Scheme::Socks5 => "socks5",
        }
    }
}

impl std::str::FromStr for Scheme {
    type Err = Error;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "file" => Ok(Scheme::File),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ftp" => Ok(Scheme::Ftp),
            "ssh" | "sftp" => Ok(Scheme::Ssh),
            "s3" => Ok(Scheme::S3),
            "socks5" | "socks5h" => Ok(Scheme::Socks5),
            other => Err(Error::config(format!("unsupported scheme: {other:?}"))),
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved connection descriptor.
///
/// `port` is 0 when the string did not carry one; backends substitute their well-known default
/// through [`Endpoint::port_or`]. `path` is percent-decoded and never empty (defaults to `/`).
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub path: String,
    pub url: url::Url,
}

fn decode(value: &str) -> anyhow::Result<String> {
    Ok(percent_encoding::percent_decode_str(value)
        .decode_utf8()
        .with_context(|| format!("{value:?} is not valid utf-8 after percent-decoding"))?
        .into_owned())
}

fn current_user() -> Result<String, Error> {
    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(Error::config(
            "no ssh user given and the current OS user has no passwd entry",
        )),
        Err(error) => Err(Error::config(format!(
            "no ssh user given and the current OS user cannot be determined: {error}"
        ))),
    }
}

impl Endpoint {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let url = url::Url::parse(value)
            .map_err(|error| Error::config(format!("failed to parse {value:?}: {error}")))?;
        let scheme: Scheme = url.scheme().parse()?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port().unwrap_or(0);
        let mut username = if url.username().is_empty() {
            None
        } else {
            Some(decode(url.username()).map_err(|error| Error::config(format!("{error:#}")))?)
        };
        let password = url
            .password()
            .map(decode)
            .transpose()
            .map_err(|error| Error::config(format!("{error:#}")))?;
        let path = decode(url.path()).map_err(|error| Error::config(format!("{error:#}")))?;
        let path = if path.is_empty() {
            "/".to_string()
        } else {
            path
        };
        if scheme == Scheme::Ssh && username.is_none() {
            let user = current_user()?;
            tracing::debug!("no ssh user in {:?}, using {:?}", host, &user);
            username = Some(user);
        }
        if scheme != Scheme::File && host.is_empty() {
            return Err(Error::config(format!("{value:?} has no host")));
        }
        Ok(Self {
            scheme,
            host,
            port,
            username,
            password,
            path,
            url,
        })
    }

    /// The explicit port, or `default` when none was given.
    pub fn port_or(&self, default: u16) -> u16 {
        if self.port == 0 { default } else { self.port }
    }

    /// `host:port` with the backend default applied.
    pub fn addr(&self, default_port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port_or(default_port))
        } else {
            format!("{}:{}", self.host, self.port_or(default_port))
        }
    }

    /// Same endpoint, different root path.
    #[must_use]
    pub fn with_path(&self, path: &str) -> Self {
        let mut endpoint = self.clone();
        endpoint.path = if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        };
        endpoint.url.set_path(&endpoint.path);
        endpoint
    }

    /// A proxy embedded as `?proxy=<uri>` in the connection string.
    pub fn query_proxy(&self) -> Result<Option<Endpoint>, Error> {
        self.url
            .query_pairs()
            .find(|(key, _)| key == "proxy")
            .map(|(_, value)| Endpoint::parse(&value))
            .transpose()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.username {
            write!(f, "{user}@")?;
        }
        f.write_str(&self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.path)
    }
}

// passwords stay out of logs
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("path", &self.path)
            .finish()
    }
}

/// Turns a bare filesystem path into a `file://` URI; anything containing `://` is returned as is.
pub fn normalize_location(location: &str) -> Result<String, Error> {
    if location.contains("://") {
        return Ok(location.to_string());
    }
    let absolute = std::path::absolute(location)
        .with_context(|| format!("failed to get absolute path for {location:?}"))?;
    let url = url::Url::from_file_path(&absolute)
        .map_err(|()| Error::config(format!("{absolute:?} is not a valid file path")))?;
    let mut normalized = url.to_string();
    // keep the trailing separator, it's meaningful for destination directories
    if location.ends_with('/') && !normalized.ends_with('/') {
        normalized.push('/');
    }
    Ok(normalized)
}
