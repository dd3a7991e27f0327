//! Echo client session.
//!
//! A [`ClientSession`] connects once, then alternates reads with up to
//! `probe_limit` probe writes. After the last probe it keeps reading until the
//! server closes the channel or the caller cancels.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::error::{ConnectError, ReadError, WriteError};
use crate::transport::HandshakeContext;

/// Port used when none is configured
pub const DEFAULT_PORT: u16 = 443;

/// Payload sent by default: `h`, `i`, NUL
pub const DEFAULT_PROBE: &[u8] = b"hi\0";

/// Client session configuration
#[derive(Clone, Debug)]
pub struct ClientSessionConfig {
    /// Server host name or address literal
    pub host: String,
    /// Server TCP port
    pub port: u16,
    /// Bytes written on each probe
    pub probe: Vec<u8>,
    /// Number of probes sent over the session's lifetime
    pub probe_limit: u32,
}

impl Default for ClientSessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            probe: DEFAULT_PROBE.to_vec(),
            probe_limit: 3,
        }
    }
}

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Created, not started
    Idle,
    /// TCP connect and handshake in flight
    Connecting,
    /// Handshake done; the run loop may proceed
    Connected,
    /// Channel released; terminal
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Connect or handshake failed
    ConnectFailed,
    /// The server closed the channel
    PeerClosed,
    /// The caller's cancellation token fired
    Cancelled,
    /// An unrecoverable read or write error
    Fatal,
}

/// Statistics for a session
#[derive(Clone, Debug, Default)]
pub struct SessionStats {
    /// Decrypted bytes received
    pub bytes_in: u64,
    /// Bytes written
    pub bytes_out: u64,
    /// Probes written successfully
    pub probes_sent: u32,
    /// Non-empty reads
    pub reads: u64,
    /// Run loop iterations
    pub iterations: u64,
    /// Time from `start` to a completed handshake
    pub connect_time: Option<Duration>,
    /// How the session ended; `None` while it is still running
    pub end: Option<CloseReason>,
}

/// One client connection to an echo server
#[derive(Debug)]
pub struct ClientSession {
    config: ClientSessionConfig,
    state: ClientState,
    channel: Option<SecureChannel>,
    stats: SessionStats,
}

impl ClientSession {
    /// Create an idle session
    pub fn new(config: ClientSessionConfig) -> Self {
        Self {
            config,
            state: ClientState::Idle,
            channel: None,
            stats: SessionStats::default(),
        }
    }

    /// Connect and handshake. On failure the session is `Closed`.
    pub async fn start(&mut self, ctx: &HandshakeContext) -> Result<(), ConnectError> {
        if self.state != ClientState::Idle {
            return Err(ConnectError::AlreadyStarted);
        }
        self.state = ClientState::Connecting;

        let started = tokio::time::Instant::now();
        match SecureChannel::connect(&self.config.host, self.config.port, ctx).await {
            Ok(channel) => {
                self.stats.connect_time = Some(started.elapsed());
                self.channel = Some(channel);
                self.state = ClientState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to connect to {}:{}: {}",
                    self.config.host, self.config.port, e
                );
                self.state = ClientState::Closed;
                self.stats.end = Some(CloseReason::ConnectFailed);
                Err(e)
            }
        }
    }

    /// Drive the read/probe loop until the server closes, an error occurs
    /// or `cancel` fires, then shut the channel down.
    ///
    /// Returns immediately if the session is not `Connected`.
    pub async fn run(&mut self, cancel: CancellationToken) -> SessionStats {
        if self.state != ClientState::Connected {
            return self.stats.clone();
        }
        if let Some(channel) = self.channel.as_mut() {
            let end = drive(channel, &self.config, &mut self.stats, &cancel).await;
            self.stats.end = Some(end);
        }
        self.close().await;

        info!(
            "Client session ended ({:?}): {} probes, {} bytes out, {} bytes in",
            self.stats.end, self.stats.probes_sent, self.stats.bytes_out, self.stats.bytes_in
        );
        self.stats.clone()
    }

    /// Shut the channel down (once) and move to `Closed`
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.shutdown().await;
            info!("Client has disconnected from the server");
        }
        self.state = ClientState::Closed;
    }

    /// Current lifecycle state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// True while the run loop may keep going
    pub fn is_running(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Counters so far
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Session configuration
    pub fn config(&self) -> &ClientSessionConfig {
        &self.config
    }
}

async fn drive(
    channel: &mut SecureChannel,
    config: &ClientSessionConfig,
    stats: &mut SessionStats,
    cancel: &CancellationToken,
) -> CloseReason {
    loop {
        if cancel.is_cancelled() {
            return CloseReason::Cancelled;
        }
        stats.iterations += 1;

        match channel.read() {
            Ok(data) if !data.is_empty() => {
                stats.bytes_in += data.len() as u64;
                stats.reads += 1;
            }
            Ok(_) => {}
            Err(ReadError::PeerClosed) => {
                info!("Server closed the connection");
                return CloseReason::PeerClosed;
            }
            Err(e) => {
                warn!("Read from server failed: {}", e);
                return CloseReason::Fatal;
            }
        }

        if stats.probes_sent < config.probe_limit {
            match channel.write(&config.probe).await {
                Ok(n) => {
                    stats.bytes_out += n as u64;
                    stats.probes_sent += 1;
                    debug!("Sent probe {}/{}", stats.probes_sent, config.probe_limit);
                }
                Err(WriteError::PeerClosed) => {
                    info!("Server closed the connection");
                    return CloseReason::PeerClosed;
                }
                Err(e) => {
                    warn!("Write to server failed: {}", e);
                    return CloseReason::Fatal;
                }
            }
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {}
                readable = channel.readable() => {
                    if let Err(e) = readable {
                        warn!("Socket to server failed: {}", e);
                        return CloseReason::Fatal;
                    }
                }
            }
        }
    }
}
