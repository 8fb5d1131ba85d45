//! Command line locations: bare paths or connection strings.
use anyhow::anyhow;
use common::address::{Endpoint, normalize_location};

/// The part of `location` that names a path: everything after the authority of a connection
/// string, or the whole string for a bare path.
fn path_part(location: &str) -> &str {
    match location.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |idx| &rest[idx..]),
        None => location,
    }
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(path, _)| path)
}

/// Rejects targets ending in `.` or `..`, which would silently name a different directory than
/// the one written.
pub fn validate_target(target: &str) -> anyhow::Result<()> {
    let path = strip_query(path_part(target));
    if path == "." || path.ends_with("/.") {
        return Err(anyhow!(
            "Target path cannot end with '.' (current directory).\n\
            If you want to transfer into the current directory, use './' instead."
        ));
    }
    if path == ".." || path.ends_with("/..") {
        return Err(anyhow!(
            "Target path cannot end with '..' (parent directory).\n\
            If you want to transfer into the parent directory, use '../' instead."
        ));
    }
    Ok(())
}

/// Rejects sources containing `..` segments; they are only meaningful on the local disk and
/// would otherwise escape the root relative paths are computed against.
pub fn validate_source(source: &str) -> anyhow::Result<()> {
    let path = strip_query(path_part(source));
    if source.contains("://") && path.split('/').any(|segment| segment == "..") {
        return Err(anyhow!(
            "Source {source:?} contains '..', please use an absolute path"
        ));
    }
    Ok(())
}

/// Normalizes `location` into a connection string and parses it.
pub fn resolve(location: &str) -> anyhow::Result<Endpoint> {
    let normalized = normalize_location(location)?;
    let mut endpoint = Endpoint::parse(&normalized)?;
    // a trailing "." of a bare path refers to the directory itself
    if let Some(path) = endpoint.path.strip_suffix("/.") {
        endpoint = endpoint.with_path(path);
    }
    tracing::debug!("{:?} resolved to {}", location, &endpoint);
    Ok(endpoint)
}
