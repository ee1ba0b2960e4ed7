//! Client error types

use std::fmt;
use std::io;

/// Errors surfaced by the connection and protocol layers
///
/// The audio-side components (codec, buffers, pipelines) report errors as
/// strings; only the networking path needs structured kinds so callers can
/// distinguish configuration problems from dead connections.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Bad or incomplete configuration (empty host, missing key file, ...)
    InvalidConfig(String),
    /// Host name did not resolve to any address
    Resolve(String),
    /// TCP connect or socket-level failure
    Connect(String),
    /// TLS handshake or certificate loading failure
    Tls(String),
    /// I/O failure on an established connection
    Io(String),
    /// Control frame violated the protocol (oversized payload, bad type)
    Protocol(String),
    /// Operation requires a live connection
    Disconnected,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            ClientError::Resolve(msg) => write!(f, "address resolution failed: {}", msg),
            ClientError::Connect(msg) => write!(f, "connection failed: {}", msg),
            ClientError::Tls(msg) => write!(f, "TLS error: {}", msg),
            ClientError::Io(msg) => write!(f, "I/O error: {}", msg),
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClientError::Disconnected => write!(f, "not connected"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}
