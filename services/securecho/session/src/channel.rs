//! Encrypted duplex byte stream over one TCP connection.
//!
//! The channel drives a sans-IO `rustls::Connection` over a non-blocking
//! tokio `TcpStream`. Every TLS step is attempted with `try_read`/`try_write`;
//! a would-block result parks the task on socket readiness, which is the only
//! place the channel yields. The engine's `wants_read`/`wants_write`
//! predicates decide which readiness to wait for.
//!
//! ```text
//! wrap ──▶ handshake ──▶ read / write (any order) ──▶ shutdown
//!   │          │                                        ▲
//!   │          └── error: channel dropped ──────────────┤
//!   └── read/write before handshake: HandshakeIncomplete│
//! ```

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::diagnostics::{DiagnosticSink, Direction};
use crate::error::{ConnectError, HandshakeError, ReadError, WriteError};
use crate::transport::{HandshakeContext, RetryPolicy, Role};

/// Plaintext is drained from the engine in chunks of this size
const READ_CHUNK: usize = 4096;

/// Blocking-style adapter over a non-blocking socket, as the TLS engine expects
struct RawIo<'a>(&'a TcpStream);

impl Read for RawIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for RawIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of one non-blocking handshake attempt
enum Step {
    /// Records moved; try again immediately
    Progress,
    /// The socket would block; wait for this readiness
    Blocked(Interest),
    /// TCP EOF from the peer
    Eof,
}

/// Socket plus TLS engine; dropped together on shutdown
struct ChannelIo {
    stream: TcpStream,
    tls: rustls::Connection,
}

impl ChannelIo {
    fn step(&mut self) -> Result<Step, HandshakeError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut RawIo(&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Step::Blocked(Interest::WRITABLE))
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !self.tls.is_handshaking() {
            return Ok(Step::Progress);
        }
        if !self.tls.wants_read() {
            return Ok(Step::Blocked(Interest::READABLE));
        }

        match self.tls.read_tls(&mut RawIo(&self.stream)) {
            Ok(0) => Ok(Step::Eof),
            Ok(_) => {
                if let Err(e) = self.tls.process_new_packets() {
                    // Best effort: let the peer see the alert
                    let _ = self.tls.write_tls(&mut RawIo(&self.stream));
                    return Err(e.into());
                }
                Ok(Step::Progress)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(Step::Blocked(Interest::READABLE))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush pending records, waiting for writability as often as needed
    async fn flush(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut RawIo(&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.stream.writable().await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Flush what the socket accepts right now
    fn flush_nonblocking(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut RawIo(&self.stream)) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Move all buffered plaintext into `out`; returns true once the peer has closed
fn drain_plaintext(tls: &mut rustls::Connection, out: &mut Vec<u8>) -> Result<bool, ReadError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match tls.reader().read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            // TCP EOF without close_notify
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(true),
            Err(e) => return Err(ReadError::Fatal(e)),
        }
    }
}

/// One encrypted duplex byte stream
pub struct SecureChannel {
    role: Role,
    peer: SocketAddr,
    io: Option<ChannelIo>,
    handshake_complete: bool,
    peer_closed: bool,
    retry: RetryPolicy,
    sink: Arc<dyn DiagnosticSink>,
}

impl SecureChannel {
    pub(crate) fn new(
        role: Role,
        stream: TcpStream,
        peer: SocketAddr,
        tls: rustls::Connection,
        retry: RetryPolicy,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            role,
            peer,
            io: Some(ChannelIo { stream, tls }),
            handshake_complete: false,
            peer_closed: false,
            retry,
            sink,
        }
    }

    /// Open TCP to `host:port` and complete the client handshake
    pub async fn connect(
        host: &str,
        port: u16,
        ctx: &HandshakeContext,
    ) -> Result<Self, ConnectError> {
        let target = format!("{}:{}", host, port);
        info!("Attempting to connect to {}", target);

        let stream = TcpStream::connect(&target)
            .await
            .map_err(|source| ConnectError::TransportUnavailable {
                addr: target.clone(),
                source,
            })?;
        debug!("TCP connection established to {}", target);

        let mut channel = ctx.wrap_for_host(stream, host)?;
        channel.drive_handshake().await?;

        info!("Connection to {} was successful", target);
        Ok(channel)
    }

    /// Run the server side of the handshake on an accepted stream
    pub async fn accept_handshake(&mut self) -> Result<(), HandshakeError> {
        if self.role != Role::Server {
            return Err(HandshakeError::WrongRole);
        }
        self.drive_handshake().await
    }

    async fn drive_handshake(&mut self) -> Result<(), HandshakeError> {
        if self.handshake_complete {
            return Err(HandshakeError::AlreadyComplete);
        }
        let limit = self.retry.max_handshake_retries;
        let peer = self.peer;
        let io = self.io.as_mut().ok_or(HandshakeError::Closed)?;

        let mut attempts = 0u32;
        while io.tls.is_handshaking() || io.tls.wants_write() {
            match io.step()? {
                Step::Progress => {}
                Step::Eof => return Err(HandshakeError::PeerClosed),
                Step::Blocked(interest) => {
                    attempts += 1;
                    if attempts > limit {
                        return Err(HandshakeError::RetriesExhausted { attempts: limit });
                    }
                    trace!("Handshake with {} would block ({:?}), retry {}", peer, interest, attempts);
                    io.stream.ready(interest).await?;
                }
            }
        }

        debug!(
            "Handshake with {} complete ({:?}, {:?}) after {} retries",
            peer,
            io.tls.protocol_version(),
            io.tls.negotiated_cipher_suite().map(|s| s.suite()),
            attempts
        );
        self.handshake_complete = true;
        Ok(())
    }

    /// Drain every decrypted byte available right now.
    ///
    /// Never waits; returns an empty buffer when nothing has arrived. Bytes
    /// that arrive together with the peer's close are returned first and the
    /// following call reports [`ReadError::PeerClosed`].
    pub fn read(&mut self) -> Result<Vec<u8>, ReadError> {
        if !self.handshake_complete {
            return Err(ReadError::HandshakeIncomplete);
        }
        if self.peer_closed {
            return Err(ReadError::PeerClosed);
        }
        let io = self.io.as_mut().ok_or(ReadError::Closed)?;

        let mut data = Vec::new();
        let mut closed = false;
        loop {
            let pulled = match io.tls.read_tls(&mut RawIo(&io.stream)) {
                Ok(0) => {
                    closed = true;
                    false
                }
                Ok(_) => true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
                Err(e) => return Err(ReadError::from_io(e)),
            };

            let state = io.tls.process_new_packets()?;
            closed |= state.peer_has_closed();
            closed |= drain_plaintext(&mut io.tls, &mut data)?;

            if !pulled || closed {
                break;
            }
        }

        // Alerts and post-handshake messages queued by the engine
        if let Err(e) = io.flush_nonblocking() {
            debug!("Flush after read to {} failed: {}", self.peer, e);
        }

        if closed {
            debug!("Peer {} closed the channel", self.peer);
            self.peer_closed = true;
        }
        if !data.is_empty() {
            self.sink.observe(self.peer, Direction::Received, &data);
            return Ok(data);
        }
        if closed {
            return Err(ReadError::PeerClosed);
        }
        Ok(data)
    }

    /// Wait until the socket has something to read (data or EOF)
    pub async fn readable(&self) -> Result<(), ReadError> {
        match &self.io {
            Some(io) => io.stream.readable().await.map_err(ReadError::from_io),
            None => Err(ReadError::Closed),
        }
    }

    /// Send all of `bytes`, retrying through would-block until done.
    ///
    /// On success the return value always equals `bytes.len()`. A close
    /// received from the peer only ends its direction: writing stays allowed
    /// until the socket fails or [`shutdown`](Self::shutdown) runs.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        if !self.handshake_complete {
            return Err(WriteError::HandshakeIncomplete);
        }
        let io = self.io.as_mut().ok_or(WriteError::Closed)?;

        let mut sent = 0;
        while sent < bytes.len() {
            sent += io.tls.writer().write(&bytes[sent..]).map_err(WriteError::Fatal)?;
            io.flush().await.map_err(WriteError::from_io)?;
        }

        if !bytes.is_empty() {
            self.sink.observe(self.peer, Direction::Sent, bytes);
        }
        Ok(sent)
    }

    /// Notify the peer and release the socket and TLS state.
    ///
    /// Idempotent: later calls do nothing.
    pub async fn shutdown(&mut self) {
        let Some(mut io) = self.io.take() else {
            return;
        };

        if self.handshake_complete {
            io.tls.send_close_notify();
            match tokio::time::timeout(self.retry.shutdown_grace, io.flush()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Could not deliver close_notify to {}: {}", self.peer, e),
                Err(_) => debug!("Timed out delivering close_notify to {}", self.peer),
            }
        }
        if let Err(e) = io.stream.shutdown().await {
            debug!("TCP shutdown for {} failed: {}", self.peer, e);
        }

        info!("Channel to {} closed", self.peer);
    }

    /// Side of the handshake this channel plays
    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// True once the handshake finished successfully
    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// True once a read observed the peer's close
    pub fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// False after [`shutdown`](Self::shutdown)
    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("handshake_complete", &self.handshake_complete)
            .field("peer_closed", &self.peer_closed)
            .finish()
    }
}
