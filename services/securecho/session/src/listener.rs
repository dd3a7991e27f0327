//! TCP accept loop for the echo server.
//!
//! The listener owns the bound socket, the server [`HandshakeContext`] and the
//! [`ConnectionRegistry`]. Every accepted stream is wrapped and handed to a new
//! [`ConnectionHandle`]; the handshake runs on the worker task, so a slow
//! client never holds up `accept`.

use std::net::SocketAddr;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId, ConnectionStats};
use crate::error::ListenerError;
use crate::registry::ConnectionRegistry;
use crate::transport::{HandshakeContext, Role};

/// Pause after a failed accept so persistent errors (EMFILE) don't spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Per-listener limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Deadline for each server handshake; `None` disables it
    pub handshake_timeout: Option<Duration>,
    /// Live connections allowed at once; further streams are closed on accept
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Some(Duration::from_secs(10)),
            max_connections: 1024,
        }
    }
}

/// Bound listener plus the connections it spawned
#[derive(Debug)]
pub struct ListenerLoop {
    inner: TcpListener,
    local_addr: SocketAddr,
    ctx: HandshakeContext,
    settings: ServerSettings,
    registry: ConnectionRegistry,
}

impl ListenerLoop {
    /// Bind `addr` and prepare to accept. Nothing is spawned on failure.
    pub async fn init(
        addr: SocketAddr,
        ctx: HandshakeContext,
        settings: ServerSettings,
    ) -> Result<Self, ListenerError> {
        if ctx.role() != Role::Server {
            return Err(ListenerError::WrongRole);
        }

        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::BindFailed { addr, source })?;
        let local_addr = inner
            .local_addr()
            .map_err(|source| ListenerError::BindFailed { addr, source })?;

        info!(
            "Listening on {} (max connections: {}, handshake timeout: {:?})",
            local_addr, settings.max_connections, settings.handshake_timeout
        );

        // One grace period to react to the stop, one to flush close_notify
        let registry = ConnectionRegistry::with_join_grace(ctx.retry_policy().shutdown_grace * 2);

        Ok(Self {
            inner,
            local_addr,
            ctx,
            settings,
            registry,
        })
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Limits in force
    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    /// Spawned connections
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Spawned connections, mutably
    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    /// Accept at most one pending connection without waiting.
    ///
    /// Returns `Ok(None)` when nothing is pending or the stream was refused.
    pub fn poll_once(&mut self) -> Result<Option<ConnectionId>, ListenerError> {
        match self.inner.accept().now_or_never() {
            None => Ok(None),
            Some(Ok((stream, peer))) => Ok(self.admit(stream, peer)),
            Some(Err(e)) => Err(ListenerError::Accept(e)),
        }
    }

    /// Wait for the next connection and spawn its worker
    pub async fn accept_next(&mut self) -> Result<Option<ConnectionId>, ListenerError> {
        let (stream, peer) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        Ok(self.admit(stream, peer))
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) -> Option<ConnectionId> {
        info!("Accepted TCP connection from {}", peer);
        self.registry.reap();

        if self.registry.len() >= self.settings.max_connections {
            warn!(
                "Connection limit of {} reached; closing connection from {}",
                self.settings.max_connections, peer
            );
            return None;
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let channel = match self.ctx.wrap(stream) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("Could not set up TLS state for {}: {}", peer, e);
                return None;
            }
        };

        let handle = ConnectionHandle::spawn(channel, self.settings.handshake_timeout);
        let id = handle.id();
        self.registry.add(handle);
        info!("New client {} connected as {}", peer, id);
        Some(id)
    }

    /// Accept until `shutdown` fires, then stop every connection.
    ///
    /// Accept errors are logged and the loop keeps going.
    pub async fn run(mut self, shutdown: CancellationToken) -> Vec<ConnectionStats> {
        info!("Waiting for connections on {}", self.local_addr);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested; no longer accepting connections");
                    break;
                }
                accepted = self.accept_next() => {
                    if let Err(e) = accepted {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
        self.shutdown().await
    }

    /// Stop and join every connection, then release the socket
    pub async fn shutdown(mut self) -> Vec<ConnectionStats> {
        let stats = self.registry.stop_all().await;
        info!("Listener on {} closed", self.local_addr);
        stats
    }
}

/// Bind an OS-assigned port on 127.0.0.1; read it back with [`ListenerLoop::local_addr`]
pub async fn bind_ephemeral(
    ctx: HandshakeContext,
    settings: ServerSettings,
) -> Result<ListenerLoop, ListenerError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    ListenerLoop::init(addr, ctx, settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ClientMaterial, ServerMaterial};

    fn server_context() -> HandshakeContext {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        HandshakeContext::server(ServerMaterial::from_pem(
            certified.cert.pem(),
            certified.key_pair.serialize_pem(),
        ))
        .unwrap()
    }

    #[test]
    fn test_default_settings() {
        let settings = ServerSettings::default();
        assert_eq!(settings.handshake_timeout, Some(Duration::from_secs(10)));
        assert_eq!(settings.max_connections, 1024);
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_bind_failed() {
        let first = bind_ephemeral(server_context(), ServerSettings::default())
            .await
            .unwrap();
        let taken = first.local_addr();

        let second = ListenerLoop::init(taken, server_context(), ServerSettings::default()).await;
        match second {
            Err(ListenerError::BindFailed { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected BindFailed, got {:?}", other),
        }
        assert!(first.registry().is_empty());
    }

    #[tokio::test]
    async fn test_client_context_rejected() {
        let ctx = HandshakeContext::client(ClientMaterial {
            insecure_skip_verify: true,
            ..Default::default()
        })
        .unwrap();
        let result = bind_ephemeral(ctx, ServerSettings::default()).await;
        assert!(matches!(result, Err(ListenerError::WrongRole)));
    }

    #[tokio::test]
    async fn test_poll_once_without_pending_connection() {
        let mut listener = bind_ephemeral(server_context(), ServerSettings::default())
            .await
            .unwrap();
        assert!(listener.poll_once().unwrap().is_none());
        assert!(listener.registry().is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit_refuses_extra_streams() {
        let settings = ServerSettings {
            max_connections: 1,
            ..Default::default()
        };
        let mut listener = bind_ephemeral(server_context(), settings).await.unwrap();
        assert_eq!(listener.settings().max_connections, 1);
        assert_eq!(listener.registry().join_grace(), Duration::from_secs(4));
        let addr = listener.local_addr();

        let _first = TcpStream::connect(addr).await.unwrap();
        assert!(listener.accept_next().await.unwrap().is_some());

        let _second = TcpStream::connect(addr).await.unwrap();
        assert!(listener.accept_next().await.unwrap().is_none());
        assert_eq!(listener.registry().len(), 1);

        let stats = listener.shutdown().await;
        assert_eq!(stats.len(), 1);
    }
}
