//! Error types for the camoflow transport.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type alias for camoflow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Operation tag attached to surfaced errors for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Active connection establishment
    Dial,
    /// Passive listener setup
    Listen,
    /// Inbound packet delivery
    Read,
    /// Outbound packet delivery
    Write,
    /// Listener client intake
    Accept,
    /// Connection teardown
    Close,
    /// Fake three-way handshake exchange
    Handshake,
    /// Upstream transport tuning
    Tune,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Dial => "dial",
            Op::Listen => "listen",
            Op::Read => "read",
            Op::Write => "write",
            Op::Accept => "accept",
            Op::Close => "close",
            Op::Handshake => "handshake",
            Op::Tune => "tune",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the camoflow transport.
#[derive(Error, Debug)]
pub enum Error {
    /// Capture or injection failed at the raw device
    #[error("raw device i/o: {0}")]
    RawIo(String),

    /// A captured packet could not be decoded
    #[error("parse packet: {0}")]
    Parse(String),

    /// Data arrived from an address with no peer record
    #[error("peer {0} unauthorized")]
    Unauthorized(SocketAddr),

    /// Caller asked to write to an address with no peer record
    #[error("peer {0} unrecognized")]
    Unrecognized(SocketAddr),

    /// The cipher refused a payload
    #[error("cipher: {0}")]
    Crypto(String),

    /// A fragment flow is missing pieces (internal; never surfaced to callers)
    #[error("incomplete fragments")]
    IncompleteFragments,

    /// The network layer is not IPv4
    #[error("network layer {0} not supported")]
    UnsupportedNetworkLayer(String),

    /// The transport layer is neither TCP nor UDP
    #[error("transport layer {0} not supported")]
    UnsupportedTransportLayer(String),

    /// The destination address is not an IPv4 TCP or UDP address
    #[error("address {0} not supported")]
    UnsupportedAddressType(SocketAddr),

    /// A read or write deadline expired
    #[error("timeout")]
    Timeout,

    /// A buffer was too short to hold a complete header
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    Buffer {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// An error wrapped with its originating operation and endpoint addresses
    #[error("{op} camoflow {local} -> {remote}: {source}")]
    Op {
        /// The operation that failed
        op: Op,
        /// Local endpoint description
        local: String,
        /// Remote endpoint description
        remote: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a new raw-device error.
    pub fn raw_io(msg: impl Into<String>) -> Self {
        Error::RawIo(msg.into())
    }

    /// Create a new packet-parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Create a new cipher error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Wrap this error with its originating operation and endpoints.
    pub fn with_op(self, op: Op, local: impl fmt::Display, remote: impl fmt::Display) -> Self {
        Error::Op {
            op,
            local: local.to_string(),
            remote: remote.to_string(),
            source: Box::new(self),
        }
    }

    /// Check whether this error (possibly op-wrapped) is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout => true,
            Error::Op { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Check whether this error (possibly op-wrapped) came from the raw device.
    pub fn is_raw_io(&self) -> bool {
        match self {
            Error::RawIo(_) => true,
            Error::Op { source, .. } => source.is_raw_io(),
            _ => false,
        }
    }
}
