//! Error taxonomy for the session layer.
//!
//! Connection-scoped errors ([`HandshakeError`], [`ReadError`], [`WriteError`])
//! never leave the task that owns the channel. Listener-scoped errors
//! ([`ListenerError`]) and [`MaterialError`] end startup.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Failure to establish an outbound secure channel
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The raw TCP connection could not be established
    #[error("transport unavailable for {addr}: {source}")]
    TransportUnavailable {
        /// Target as given by the caller (`host:port`)
        addr: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The host cannot be used as a TLS server name
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// TCP connected but the handshake never completed
    #[error("handshake failed: {0}")]
    HandshakeFailed(#[from] HandshakeError),

    /// `start` was called on a session that already left `Idle`
    #[error("session already started")]
    AlreadyStarted,
}

/// Failure while negotiating a channel
#[derive(Error, Debug)]
pub enum HandshakeError {
    /// The TLS engine rejected the peer's messages
    #[error("protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    /// Socket failure during the handshake
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the socket before the handshake finished
    #[error("peer closed the connection during handshake")]
    PeerClosed,

    /// Would-block retries went past the configured cap
    #[error("handshake did not complete after {attempts} retries")]
    RetriesExhausted {
        /// Number of would-block waits performed
        attempts: u32,
    },

    /// The caller-imposed deadline elapsed
    #[error("handshake timed out")]
    TimedOut,

    /// `accept_handshake` was called on a channel that is already negotiated
    #[error("handshake already complete")]
    AlreadyComplete,

    /// The channel was shut down before the handshake started
    #[error("channel is closed")]
    Closed,

    /// The context or channel belongs to the other side of the protocol
    #[error("operation does not match the channel role")]
    WrongRole,
}

/// Failure reading application data
#[derive(Error, Debug)]
pub enum ReadError {
    /// Application data requested before the handshake completed
    #[error("handshake not complete")]
    HandshakeIncomplete,

    /// Peer sent close_notify or the stream reached EOF
    #[error("peer closed the channel")]
    PeerClosed,

    /// The local side already shut the channel down
    #[error("channel is closed")]
    Closed,

    /// Corrupt or unexpected TLS records
    #[error("protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    /// Any other socket failure
    #[error("fatal i/o error: {0}")]
    Fatal(io::Error),
}

/// Failure writing application data
#[derive(Error, Debug)]
pub enum WriteError {
    /// Application data offered before the handshake completed
    #[error("handshake not complete")]
    HandshakeIncomplete,

    /// Peer is gone (close_notify seen, reset or broken pipe)
    #[error("peer closed the channel")]
    PeerClosed,

    /// The local side already shut the channel down
    #[error("channel is closed")]
    Closed,

    /// Any other socket failure
    #[error("fatal i/o error: {0}")]
    Fatal(io::Error),
}

impl WriteError {
    /// Classify a socket error raised while flushing records
    pub(crate) fn from_io(err: io::Error) -> Self {
        if is_peer_gone(&err) {
            WriteError::PeerClosed
        } else {
            WriteError::Fatal(err)
        }
    }
}

impl ReadError {
    pub(crate) fn from_io(err: io::Error) -> Self {
        if is_peer_gone(&err) {
            ReadError::PeerClosed
        } else {
            ReadError::Fatal(err)
        }
    }
}

/// Errors raised by the listener loop
#[derive(Error, Debug)]
pub enum ListenerError {
    /// Port in use, permission denied or bad address
    #[error("could not bind {addr}: {source}")]
    BindFailed {
        /// Requested bind address
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// accept(2) failed
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The listener was given a client handshake context
    #[error("listener requires a server handshake context")]
    WrongRole,
}

/// Errors loading certificate or key material into a handshake context
#[derive(Error, Debug)]
pub enum MaterialError {
    /// PEM could not be parsed
    #[error("failed to parse {what}: {source}")]
    Pem {
        /// Which item was being parsed
        what: &'static str,
        /// Parser error
        #[source]
        source: io::Error,
    },

    /// The PEM input held no usable item
    #[error("no {0} found")]
    Missing(&'static str),

    /// Configured TLS server name is not a valid DNS name or IP address
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// The secret provider failed
    #[error("key source failed: {0}")]
    KeySource(#[source] io::Error),

    /// The TLS engine refused the material (e.g. key does not match certificate)
    #[error("material rejected: {0}")]
    Rejected(#[from] rustls::Error),
}

/// Socket errors that mean "the other end went away" rather than a local fault
pub(crate) fn is_peer_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}
