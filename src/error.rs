//! Unified error type.

use thiserror::Error;

/// Boxed error returned by handler and middleware code.
///
/// Handlers are user code; they can fail for any reason, so the container
/// accepts anything that converts with `?`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shorthand for results carrying the container's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by hearth's fallible operations.
///
/// Application-level failures (404, 500, ...) are expressed as HTTP responses,
/// not as `Error`s. This type surfaces misuse of the container API and
/// infrastructure failures.
#[derive(Debug, Error)]
pub enum Error {
    /// A URL pattern that is none of the four supported forms.
    #[error("invalid url pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    /// A registration or context setting was mutated after `init()`.
    #[error("the container has already been initialized")]
    AlreadyInitialized,

    /// A handler or middleware failed in `init`; startup is aborted.
    #[error("failed to initialize `{component}`: {source}")]
    Initialization {
        component: String,
        #[source]
        source: BoxError,
    },

    /// The session was invalidated (explicitly, by expiry, or at shutdown).
    #[error("the session has been invalidated")]
    InvalidatedSession,

    /// Response or request API misuse.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("manifest: {0}")]
    Manifest(String),

    #[error("invalid socket address: {0}")]
    Addr(#[from] std::net::AddrParseError),
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}
