//! Error taxonomy shared by every backend and the transfer orchestrator.
//!
//! Backends mostly build errors with [`anyhow::Context`] and let `?` convert them into
//! [`Error::Other`]. The typed variants exist where a caller needs to branch on the kind:
//! [`Error::NotFound`] drives directory creation and fresh-copy decisions, while
//! [`Error::Configuration`] and [`Error::Connection`] abort the run before any transfer work.
//!
//! # Logging Convention
//! The Display implementation shows the full error chain of the wrapped source:
//! ```ignore
//! tracing::error!("setup failed: {}", &error);
//! ```

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed connection string, unsupported scheme or an incompatible backend pairing.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Authentication failure, dial timeout or unreachable proxy.
    #[error("failed connecting to {endpoint}: {source:#}")]
    Connection {
        endpoint: String,
        #[source]
        source: anyhow::Error,
    },
    /// The object is absent on the backend.
    #[error("{0:?} does not exist")]
    NotFound(String),
    /// An I/O failure mid-copy.
    #[error("failed transferring {path:?}: {source:#}")]
    Transfer {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    /// Destination holds more bytes than the source.
    #[error(
        "destination {path:?} is larger than its source ({destination_size} > {source_size} bytes)"
    )]
    Corruption {
        path: String,
        source_size: i64,
        destination_size: i64,
    },
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Error::NotFound(path.into())
    }

    pub fn connection(endpoint: impl std::fmt::Display, source: impl Into<anyhow::Error>) -> Self {
        Error::Connection {
            endpoint: endpoint.to_string(),
            source: source.into(),
        }
    }

    pub fn transfer(path: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Transfer {
            path: path.into(),
            source: source.into(),
        }
    }

    /// True for "object absent", including io errors of kind `NotFound` wrapped by adapters.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Other(error) => error.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
            }),
            _ => false,
        }
    }

    /// Fatal errors abort the whole run rather than a single file.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Connection { .. })
    }
}

/// Maps `ErrorKind::NotFound` onto [`Error::NotFound`] and keeps everything else as context.
pub fn from_io(error: std::io::Error, path: &str, what: &str) -> Error {
    if error.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Other(anyhow::Error::new(error).context(format!("failed {what} {path:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let error = from_io(
            std::io::Error::from(std::io::ErrorKind::NotFound),
            "/a/b",
            "reading",
        );
        assert!(matches!(error, Error::NotFound(ref path) if path == "/a/b"));
        assert!(error.is_not_found());
    }

    #[test]
    fn wrapped_io_not_found_is_detected() {
        let error: Error = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::NotFound))
            .context("stat failed")
            .into();
        assert!(error.is_not_found());
        let error: Error = anyhow::anyhow!("permission denied").into();
        assert!(!error.is_not_found());
    }

    #[test]
    fn fatal_kinds() {
        assert!(Error::config("bad scheme").is_fatal());
        assert!(Error::connection("ftp://host:21", anyhow::anyhow!("refused")).is_fatal());
        assert!(!Error::not_found("x").is_fatal());
        assert!(!Error::transfer("x", anyhow::anyhow!("broken pipe")).is_fatal());
    }
}
