//! TLS channels, echo workers and the accept loop for securecho.
//!
//! This crate holds everything between a TCP socket and the echo protocol:
//! a non-blocking TLS channel, the per-connection server workers that echo
//! what they read, the listener that spawns them, and the client session that
//! probes a server.
//!
//! ## Features
//!
//! - **Secure channel**: rustls driven over a non-blocking tokio socket, with
//!   bounded would-block retries during the handshake
//! - **Connection workers**: one task per client, stoppable through a shared flag
//! - **Registry**: deterministic stop-and-join of every live connection
//! - **Client session**: connect, send up to N probes, read until closed
//! - **Diagnostics**: pluggable sinks observing every transfer
//!
//! ## Example
//!
//! ```rust,no_run
//! use securecho_session::{ClientMaterial, ClientSession, ClientSessionConfig, HandshakeContext};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let ctx = HandshakeContext::client(ClientMaterial {
//!     roots_pem: Some(std::fs::read_to_string("ca.pem")?),
//!     ..Default::default()
//! })?;
//!
//! let mut session = ClientSession::new(ClientSessionConfig {
//!     host: "localhost".to_string(),
//!     port: 8443,
//!     ..Default::default()
//! });
//! session.start(&ctx).await?;
//! let stats = session.run(CancellationToken::new()).await;
//! println!("echoed {} bytes", stats.bytes_in);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod channel;
pub mod client;
pub mod connection;
pub mod diagnostics;
pub mod error;
pub mod listener;
pub mod registry;
pub mod transport;

pub use channel::SecureChannel;
pub use client::{ClientSession, ClientSessionConfig, ClientState, CloseReason, SessionStats};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionStats, EndReason, HandleState};
pub use diagnostics::{DiagnosticSink, Direction, RecordingSink, TracingSink};
pub use error::{ConnectError, HandshakeError, ListenerError, MaterialError, ReadError, WriteError};
pub use listener::{bind_ephemeral, ListenerLoop, ServerSettings};
pub use registry::ConnectionRegistry;
pub use transport::{
    ClientMaterial, HandshakeContext, KeySource, RetryPolicy, Role, ServerMaterial, ALPN_PROTOCOL,
};
