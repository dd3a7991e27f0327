//! TLS capability layer for securecho channels.
//!
//! A [`HandshakeContext`] holds everything the TLS engine needs for one side
//! of a connection: the rustls configuration built from certificate material,
//! the retry policy for non-blocking I/O, and the diagnostic sink new channels
//! report to. Contexts are cheap to clone and are shared by every channel the
//! listener or client creates.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig, ServerConnection, SignatureScheme};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::channel::SecureChannel;
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::error::{ConnectError, HandshakeError, MaterialError};

/// ALPN identifier announced by both sides
pub const ALPN_PROTOCOL: &[u8] = b"securecho/1";

/// Which side of the handshake a channel plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake
    Client,
    /// Answers the handshake
    Server,
}

/// Bounds applied to the non-blocking retry loops of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum readiness waits a single handshake may perform
    pub max_handshake_retries: u32,
    /// Time allowed for flushing close_notify during shutdown
    pub shutdown_grace: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_handshake_retries: 64,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Supplies the private key PEM when a server context is created
pub type KeySource = Arc<dyn Fn() -> io::Result<String> + Send + Sync>;

/// Certificate chain and key for the server side
#[derive(Clone)]
pub struct ServerMaterial {
    /// PEM-encoded certificate chain, leaf first
    pub cert_chain_pem: String,
    /// Invoked once per context to obtain the private key PEM
    pub key_source: KeySource,
}

impl ServerMaterial {
    /// Material whose key is already in memory
    pub fn from_pem(cert_chain_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        let key_pem = key_pem.into();
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            key_source: Arc::new(move || Ok(key_pem.clone())),
        }
    }

    /// Material whose key is fetched on demand (file read, secret store, prompt)
    pub fn with_key_source<F>(cert_chain_pem: impl Into<String>, key_source: F) -> Self
    where
        F: Fn() -> io::Result<String> + Send + Sync + 'static,
    {
        Self {
            cert_chain_pem: cert_chain_pem.into(),
            key_source: Arc::new(key_source),
        }
    }
}

impl std::fmt::Debug for ServerMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerMaterial")
            .field("cert_chain_pem", &format_args!("{} bytes", self.cert_chain_pem.len()))
            .finish_non_exhaustive()
    }
}

/// Trust settings for the client side
#[derive(Debug, Clone, Default)]
pub struct ClientMaterial {
    /// PEM-encoded trust anchors used to verify the server
    pub roots_pem: Option<String>,
    /// Name checked against the server certificate; defaults to the target host
    pub server_name: Option<String>,
    /// Accept any server certificate (handshake signatures are still checked)
    pub insecure_skip_verify: bool,
}

#[derive(Clone)]
enum Engine {
    Client {
        config: Arc<ClientConfig>,
        server_name: Option<ServerName<'static>>,
    },
    Server {
        config: Arc<ServerConfig>,
    },
}

/// Shared handshake state factory for one side of the protocol
#[derive(Clone)]
pub struct HandshakeContext {
    engine: Engine,
    retry: RetryPolicy,
    sink: Arc<dyn DiagnosticSink>,
}

impl HandshakeContext {
    /// Build a client context
    pub fn client(material: ClientMaterial) -> Result<Self, MaterialError> {
        info!("Creating TLS client configuration");
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let mut config = if material.insecure_skip_verify {
            warn!("Server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth()
        } else {
            let roots_pem = material
                .roots_pem
                .as_deref()
                .ok_or(MaterialError::Missing("trust anchor"))?;
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(roots_pem)? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        let server_name = material
            .server_name
            .map(|name| {
                ServerName::try_from(name.clone()).map_err(|_| MaterialError::InvalidServerName(name))
            })
            .transpose()?;

        Ok(Self {
            engine: Engine::Client {
                config: Arc::new(config),
                server_name,
            },
            retry: RetryPolicy::default(),
            sink: Arc::new(TracingSink),
        })
    }

    /// Build a server context; the key source is invoked exactly once
    pub fn server(material: ServerMaterial) -> Result<Self, MaterialError> {
        info!("Creating TLS server configuration");
        let certs = parse_certs(&material.cert_chain_pem)?;
        let key_pem = (material.key_source)().map_err(MaterialError::KeySource)?;
        let key = parse_private_key(&key_pem)?;

        // with_single_cert rejects a key that does not belong to the leaf
        let mut config = ServerConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(Self {
            engine: Engine::Server {
                config: Arc::new(config),
            },
            retry: RetryPolicy::default(),
            sink: Arc::new(TracingSink),
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the diagnostic sink
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Side of the handshake this context produces
    pub fn role(&self) -> Role {
        match self.engine {
            Engine::Client { .. } => Role::Client,
            Engine::Server { .. } => Role::Server,
        }
    }

    /// Retry policy handed to every wrapped channel
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Wrap an accepted or connected stream; the handshake has not run yet.
    ///
    /// Client contexts without a configured server name verify against the
    /// peer's IP address.
    pub fn wrap(&self, stream: TcpStream) -> Result<SecureChannel, HandshakeError> {
        let peer = stream.peer_addr()?;
        let tls = match &self.engine {
            Engine::Server { config } => {
                rustls::Connection::Server(ServerConnection::new(Arc::clone(config))?)
            }
            Engine::Client { config, server_name } => {
                let name = server_name
                    .clone()
                    .unwrap_or_else(|| ServerName::from(peer.ip()));
                rustls::Connection::Client(ClientConnection::new(Arc::clone(config), name)?)
            }
        };
        Ok(SecureChannel::new(
            self.role(),
            stream,
            peer,
            tls,
            self.retry,
            Arc::clone(&self.sink),
        ))
    }

    /// Wrap an outbound stream, verifying the server against `host` unless a
    /// server name was configured
    pub(crate) fn wrap_for_host(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> Result<SecureChannel, ConnectError> {
        let Engine::Client { config, server_name } = &self.engine else {
            return Err(HandshakeError::WrongRole.into());
        };
        let name = match server_name {
            Some(name) => name.clone(),
            None => ServerName::try_from(host.to_owned())
                .map_err(|_| ConnectError::InvalidServerName(host.to_owned()))?,
        };
        let peer = stream.peer_addr().map_err(HandshakeError::Io)?;
        let tls = ClientConnection::new(Arc::clone(config), name).map_err(HandshakeError::Protocol)?;
        Ok(SecureChannel::new(
            Role::Client,
            stream,
            peer,
            rustls::Connection::Client(tls),
            self.retry,
            Arc::clone(&self.sink),
        ))
    }
}

impl std::fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("role", &self.role())
            .field("retry", &self.retry)
            .field("sink", &self.sink)
            .finish()
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Parse every certificate in a PEM bundle
pub fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, MaterialError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| MaterialError::Pem {
            what: "certificate chain",
            source,
        })?;
    if certs.is_empty() {
        return Err(MaterialError::Missing("certificate"));
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM document
pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, MaterialError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|source| MaterialError::Pem {
            what: "private key",
            source,
        })?
        .ok_or(MaterialError::Missing("private key"))
}

/// Verifier for `insecure_skip_verify`: trusts any certificate but still
/// requires the peer to prove possession of its key
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pem_is_missing() {
        let result = parse_certs("");
        assert!(matches!(result, Err(MaterialError::Missing("certificate"))));

        let result = parse_private_key("not a key");
        assert!(matches!(result, Err(MaterialError::Missing("private key"))));
    }

    #[test]
    fn test_client_requires_trust_anchor() {
        let result = HandshakeContext::client(ClientMaterial::default());
        assert!(matches!(result, Err(MaterialError::Missing("trust anchor"))));
    }

    #[test]
    fn test_insecure_client_context() {
        let ctx = HandshakeContext::client(ClientMaterial {
            insecure_skip_verify: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(ctx.role(), Role::Client);
        assert_eq!(ctx.retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn test_key_source_failure_is_reported() {
        let material = ServerMaterial::with_key_source("", || {
            Err(io::Error::new(io::ErrorKind::NotFound, "no key"))
        });
        // Certificate parsing fails first on empty input
        assert!(matches!(
            HandshakeContext::server(material),
            Err(MaterialError::Missing("certificate"))
        ));
    }
}
