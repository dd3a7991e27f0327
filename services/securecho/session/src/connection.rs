//! Per-connection echo workers on the server side.
//!
//! Each accepted stream gets one [`ConnectionHandle`] and one tokio task.
//!
//! ```text
//! Accepting ──handshake ok──▶ Active ──stop / peer closed / error──▶ Stopping ──▶ Stopped
//!     │                                                                          ▲
//!     └──────────────── handshake failed / stopped early ────────────────────────┘
//! ```
//!
//! The `connected` flag is the only state shared between the worker and its
//! owners. It lives in a `watch` channel, so every access goes through the
//! channel's lock, and flipping it also wakes the worker.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::error::{HandshakeError, ReadError, WriteError};

/// Relaxed ordering is enough: ids only need to be unique
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a connection worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Spawned, handshake in progress
    Accepting,
    /// Handshake done, echoing data
    Active,
    /// Leaving the loop, channel being shut down
    Stopping,
    /// Channel released; terminal
    Stopped,
}

/// Why a worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndReason {
    /// Asked to stop by an owner (or every owner went away)
    #[default]
    Stopped,
    /// The client closed its side
    PeerClosed,
    /// The handshake failed or timed out
    HandshakeFailed,
    /// An unrecoverable I/O or protocol error
    Fatal,
    /// The worker task panicked or was aborted
    Aborted,
}

/// Counters reported by a finished worker
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Decrypted bytes received
    pub bytes_in: u64,
    /// Bytes echoed back
    pub bytes_out: u64,
    /// Number of non-empty reads echoed
    pub echoes: u64,
    /// How the worker ended
    pub end: EndReason,
}

/// Owner-side view of one connection worker
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    connected: watch::Sender<bool>,
    state: watch::Receiver<HandleState>,
    task: JoinHandle<ConnectionStats>,
}

impl ConnectionHandle {
    /// Spawn the worker for a wrapped but not yet negotiated channel.
    ///
    /// `handshake_timeout` bounds the server handshake; `None` waits as long
    /// as the peer keeps the socket open. Dropping the handle without calling
    /// [`stop`](Self::stop) also stops the worker.
    pub fn spawn(channel: SecureChannel, handshake_timeout: Option<Duration>) -> Self {
        let id = ConnectionId::new();
        let peer = channel.peer_addr();
        let (connected_tx, connected_rx) = watch::channel(true);
        let (state_tx, state_rx) = watch::channel(HandleState::Accepting);

        let task = tokio::spawn(run_worker(
            id,
            channel,
            handshake_timeout,
            connected_rx,
            state_tx,
        ));

        Self {
            id,
            peer,
            connected: connected_tx,
            state: state_rx,
            task,
        }
    }

    /// Ask the worker to stop; returns immediately
    pub fn stop(&self) {
        self.connected.send_replace(false);
    }

    /// Current value of the shared `connected` flag
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Latest published lifecycle state
    pub fn state(&self) -> HandleState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle changes
    pub fn watch_state(&self) -> watch::Receiver<HandleState> {
        self.state.clone()
    }

    /// True once the worker task has returned
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Connection id
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Wait for the worker to finish and collect its counters
    pub async fn join(self) -> ConnectionStats {
        let result = self.task.await;
        collect(self.id, result)
    }

    /// Like [`join`](Self::join), but abort the worker if it has not
    /// finished within `grace` (e.g. stuck writing to a client that never reads)
    pub async fn join_within(mut self, grace: Duration) -> ConnectionStats {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(result) => collect(self.id, result),
            Err(_) => {
                warn!(
                    "Connection {} to {} did not stop within {:?}; aborting",
                    self.id, self.peer, grace
                );
                self.task.abort();
                ConnectionStats {
                    end: EndReason::Aborted,
                    ..Default::default()
                }
            }
        }
    }
}

fn collect(id: ConnectionId, result: Result<ConnectionStats, JoinError>) -> ConnectionStats {
    match result {
        Ok(stats) => stats,
        Err(e) => {
            warn!("Connection {} worker did not finish cleanly: {}", id, e);
            ConnectionStats {
                end: EndReason::Aborted,
                ..Default::default()
            }
        }
    }
}

/// Resolves once the flag is false or every sender is gone
async fn stop_requested(connected: &mut watch::Receiver<bool>) {
    let _ = connected.wait_for(|connected| !*connected).await;
}

async fn accept_with_deadline(
    channel: &mut SecureChannel,
    limit: Option<Duration>,
) -> Result<(), HandshakeError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, channel.accept_handshake())
            .await
            .unwrap_or(Err(HandshakeError::TimedOut)),
        None => channel.accept_handshake().await,
    }
}

async fn run_worker(
    id: ConnectionId,
    mut channel: SecureChannel,
    handshake_timeout: Option<Duration>,
    mut connected: watch::Receiver<bool>,
    state: watch::Sender<HandleState>,
) -> ConnectionStats {
    let peer = channel.peer_addr();
    let mut stats = ConnectionStats::default();
    debug!("Connection {} worker spawned for {}", id, peer);

    let handshake = tokio::select! {
        result = accept_with_deadline(&mut channel, handshake_timeout) => Some(result),
        _ = stop_requested(&mut connected) => None,
    };
    match handshake {
        Some(Ok(())) => {
            info!("TLS handshake completed with {} ({})", peer, id);
            state.send_replace(HandleState::Active);
            echo_loop(id, &mut channel, &mut connected, &mut stats).await;
        }
        Some(Err(e)) => {
            warn!("TLS handshake failed with {} ({}): {}", peer, id, e);
            stats.end = EndReason::HandshakeFailed;
        }
        None => {
            info!("Connection {} stopped before the handshake finished", id);
            stats.end = EndReason::Stopped;
        }
    }

    state.send_replace(HandleState::Stopping);
    channel.shutdown().await;
    state.send_replace(HandleState::Stopped);

    info!(
        "Connection {} with {} ended ({:?}): {} bytes in, {} bytes out",
        id, peer, stats.end, stats.bytes_in, stats.bytes_out
    );
    stats
}

async fn echo_loop(
    id: ConnectionId,
    channel: &mut SecureChannel,
    connected: &mut watch::Receiver<bool>,
    stats: &mut ConnectionStats,
) {
    loop {
        match channel.read() {
            Ok(data) if !data.is_empty() => {
                stats.bytes_in += data.len() as u64;
                match channel.write(&data).await {
                    Ok(n) => {
                        stats.bytes_out += n as u64;
                        stats.echoes += 1;
                    }
                    Err(WriteError::PeerClosed) => {
                        info!("Client closed connection {} before the echo was written", id);
                        stats.end = EndReason::PeerClosed;
                        return;
                    }
                    Err(e) => {
                        warn!("Write error on connection {}: {}", id, e);
                        stats.end = EndReason::Fatal;
                        return;
                    }
                }
            }
            Ok(_) => {}
            Err(ReadError::PeerClosed) => {
                info!("Client closed connection {}", id);
                stats.end = EndReason::PeerClosed;
                return;
            }
            Err(e) => {
                warn!("Read error on connection {}: {}", id, e);
                stats.end = EndReason::Fatal;
                return;
            }
        }

        // Whatever arrived alongside the close has been echoed by now
        if channel.is_peer_closed() {
            info!("Client closed connection {}", id);
            stats.end = EndReason::PeerClosed;
            return;
        }

        if !*connected.borrow_and_update() {
            stats.end = EndReason::Stopped;
            return;
        }

        tokio::select! {
            _ = stop_requested(connected) => {
                stats.end = EndReason::Stopped;
                return;
            }
            readable = channel.readable() => {
                if let Err(e) = readable {
                    warn!("Connection {} socket failed: {}", id, e);
                    stats.end = EndReason::Fatal;
                    return;
                }
            }
        }
    }
}
