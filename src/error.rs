//! Error types for the linkpool crate.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving, establishing or pooling connections.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid capability set or client configuration. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request target cannot be turned into an endpoint.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// Name resolution failed or produced no addresses.
    #[error("Resolution failed for {host}: {message}")]
    Resolution { host: String, message: String },

    /// Socket connect failed.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connect timeout (TCP + tunnel + TLS handshake) for a single route candidate.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// TLS handshake failure.
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    /// Peer certificate does not match the expected hostname.
    #[error("Hostname verification failed for {host}")]
    Verification { host: String },

    /// Peer certificate chain matched none of the configured pins.
    #[error("Certificate pinning failure for {host}: peer chain [{chain}] matched none of [{pins}]")]
    PinMismatch {
        host: String,
        pins: String,
        chain: String,
    },

    /// No mutually supported application protocol.
    #[error("Protocol negotiation failed: offered [{offered}], negotiated {negotiated}")]
    ProtocolMismatch { offered: String, negotiated: String },

    /// HTTP CONNECT tunnel could not be opened.
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    /// Proxy demanded credentials that could not be supplied.
    #[error("Proxy authentication failed: {0}")]
    ProxyAuth(String),

    /// Connection has no spare capacity. Not a failure: establish a new connection.
    #[error("Connection busy")]
    Busy,

    /// Operation on a connection that is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Pool has been shut down.
    #[error("Connection pool is shut down")]
    PoolClosed,

    /// Every route candidate failed.
    #[error("All {attempts} connection attempts failed; last error: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<Error>,
    },

    /// Overall dispatch deadline exceeded.
    #[error("Dispatch deadline exceeded after {0:?}")]
    DispatchTimeout(Duration),

    /// Dispatch was cancelled by the caller.
    #[error("Dispatch cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid target error.
    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget(message.into())
    }

    /// Create a resolution error.
    pub fn resolution(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a TLS handshake error.
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    /// Create a tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel(message.into())
    }

    /// Create an IO error with custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(io::Error::other(message.into()))
    }

    /// Peer was rejected by hostname verification or pinning.
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::Verification { .. } | Self::PinMismatch { .. })
    }

    /// Failure that ends a dispatch immediately instead of moving to the next candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidTarget(_) | Self::PoolClosed | Self::Cancelled
        )
    }
}
