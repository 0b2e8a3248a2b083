//! Top-level error types.

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// A fatal error that terminates the process with a non-zero exit code.
///
/// Per spec.md §7, only unparseable configuration, an unknown cache type,
/// and bind failures are fatal; everything else (DNS/HTTPS/cache errors
/// during a request) is folded into [`crate::resolver::FetchStatus`] and
/// never reaches this type.
#[derive(Debug)]
pub enum ExitError {
    /// The configuration file could not be read or parsed, including an
    /// unsupported `cache.type` value (serde rejects it outright, since
    /// `CacheKind` is a closed enum).
    Config(String),

    /// A listen socket could not be bound.
    Bind { addr: SocketAddr, source: io::Error },

    /// A UNIX domain socket could not be bound.
    BindUnix {
        path: std::path::PathBuf,
        source: io::Error,
    },

    /// A cache backend failed to initialize (e.g. could not open the
    /// sqlite file, connect to redis, or connect to postgres).
    CacheSetup(String),
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitError::Config(msg) => write!(f, "configuration error: {msg}"),
            ExitError::Bind { addr, source } => write!(f, "could not bind to {addr}: {source}"),
            ExitError::BindUnix { path, source } => {
                write!(f, "could not bind to {}: {source}", path.display())
            }
            ExitError::CacheSetup(msg) => write!(f, "could not set up cache backend: {msg}"),
        }
    }
}

impl std::error::Error for ExitError {}
