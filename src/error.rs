//! Crate-wide error types.
//!
//! Mirrors the error taxonomy of the original runtime (wire, protocol,
//! invalid-session, config, user) as a `thiserror` enum instead of the
//! exception-based control flow the runtime was distilled from.

use std::fmt;

/// Top-level error produced by the runtime's public operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("wire adapter I/O error: {0}")]
    Wire(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("session store error: {0}")]
    Session(#[from] SessionError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("service handler error: {0}")]
    User(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary handler error without requiring `'static` callers
    /// to know about our internal error enum.
    pub fn user<E>(err: E) -> Error
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::User(Box::new(err))
    }
}

/// Errors raised while decoding a request: malformed multipart body, bad
/// query string, or a `Content-Length` that doesn't parse.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed multipart body: {0}")]
    Multipart(String),

    #[error("invalid Content-Length header: {0}")]
    ContentLength(String),

    #[error("request body exceeded the configured cap of {cap} bytes (read {read})")]
    BodyTooLarge { cap: u64, read: u64 },

    #[error("value could not be decoded with the configured charset")]
    Encoding,
}

/// Session-store-specific failures. `InvalidSession` is not really an
/// "error" from the caller's perspective — the runtime recovers from it by
/// starting a fresh session — but it is represented here so stores can
/// report it uniformly alongside genuine I/O failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session id has invalid format or no backing data")]
    Invalid,

    #[error("session store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize session payload: {0}")]
    Encode(String),

    #[error("failed to deserialize session payload: {0}")]
    Decode(String),
}

/// Startup-time misconfiguration. Fatal: the application aborts rather than
/// entering the accept loop.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("listen address {0:?} could not be bound")]
    ListenNotBound(String),

    #[error("invalid session id bit width: {0} (must be 4, 5, or 6)")]
    InvalidSessionBitWidth(u8),
}

impl fmt::Display for crate::session::SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            crate::session::SessionOutcome::Found(data) => {
                write!(f, "Found({} bytes)", data.len())
            }
            crate::session::SessionOutcome::NotFound => write!(f, "NotFound"),
        }
    }
}
