//! Configuration handling for the securecho binary.
//!
//! Values come from, in increasing precedence: built-in defaults, an optional
//! YAML file, `SECURECHO_*` environment variables, and command-line flags
//! (applied by `main`).

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use securecho_session::{ClientSessionConfig, RetryPolicy, ServerSettings};
use tracing::{info, warn};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoConfig {
    /// Echo server settings
    pub server: ServerConfig,
    /// Probe client settings
    pub client: ClientConfig,
    /// TLS retry and shutdown tuning shared by both sides
    pub tls: TlsTuning,
}

/// Echo server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
    /// Handshake deadline, e.g. `10s`; `off` disables it
    pub handshake_timeout: String,
    /// Concurrent connection limit
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:443".to_string(),
            cert_file: PathBuf::from("certs/server.crt"),
            key_file: PathBuf::from("certs/server.key"),
            handshake_timeout: "10s".to_string(),
            max_connections: 1024,
        }
    }
}

/// Probe client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Trust anchors (PEM); required unless `insecure`
    pub ca_file: Option<PathBuf>,
    /// Name to verify instead of `host`
    pub server_name: Option<String>,
    /// Skip certificate verification
    pub insecure: bool,
    /// Probe payload
    pub probe: String,
    /// Number of probes to send
    pub probe_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 443,
            ca_file: None,
            server_name: None,
            insecure: false,
            probe: "hi\0".to_string(),
            probe_limit: 3,
        }
    }
}

/// TLS retry and shutdown tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsTuning {
    /// Readiness waits allowed per handshake
    pub max_handshake_retries: u32,
    /// Time allowed to deliver close_notify, e.g. `2s`
    pub shutdown_grace: String,
}

impl Default for TlsTuning {
    fn default() -> Self {
        Self {
            max_handshake_retries: 64,
            shutdown_grace: "2s".to_string(),
        }
    }
}

impl EchoConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; a file that cannot be read or
    /// does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: EchoConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        };

        config.apply_environment_overrides();
        Ok(config)
    }

    /// Apply `SECURECHO_*` environment variables
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup; unparsable values are ignored with a warning
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("SECURECHO_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.server.listen = listen;
        }
        if let Some(cert) = lookup("SECURECHO_CERT_FILE") {
            self.server.cert_file = PathBuf::from(cert);
        }
        if let Some(key) = lookup("SECURECHO_KEY_FILE") {
            self.server.key_file = PathBuf::from(key);
        }
        if let Some(timeout) = lookup("SECURECHO_HANDSHAKE_TIMEOUT") {
            self.server.handshake_timeout = timeout;
        }
        if let Some(max) = lookup("SECURECHO_MAX_CONNECTIONS") {
            match max.parse::<usize>() {
                Ok(max) => self.server.max_connections = max,
                Err(_) => warn!("Ignoring invalid SECURECHO_MAX_CONNECTIONS: {}", max),
            }
        }

        if let Some(host) = lookup("SECURECHO_HOST") {
            info!("Host overridden by environment: {}", host);
            self.client.host = host;
        }
        if let Some(port) = lookup("SECURECHO_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.client.port = port;
                    info!("Port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid SECURECHO_PORT: {}", port),
            }
        }
        if let Some(ca) = lookup("SECURECHO_CA_FILE") {
            self.client.ca_file = Some(PathBuf::from(ca));
        }
        if let Some(name) = lookup("SECURECHO_SERVER_NAME") {
            self.client.server_name = Some(name);
        }
        if let Some(insecure) = lookup("SECURECHO_INSECURE") {
            self.client.insecure = matches!(insecure.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(limit) = lookup("SECURECHO_PROBE_LIMIT") {
            match limit.parse::<u32>() {
                Ok(limit) => self.client.probe_limit = limit,
                Err(_) => warn!("Ignoring invalid SECURECHO_PROBE_LIMIT: {}", limit),
            }
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen))
    }

    /// Listener limits
    pub fn server_settings(&self) -> Result<ServerSettings> {
        let handshake_timeout = match self.server.handshake_timeout.as_str() {
            "off" | "none" | "0" => None,
            value => Some(parse_duration("server.handshake_timeout", value)?),
        };
        Ok(ServerSettings {
            handshake_timeout,
            max_connections: self.server.max_connections,
        })
    }

    /// Retry policy for handshake contexts
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy {
            max_handshake_retries: self.tls.max_handshake_retries,
            shutdown_grace: parse_duration("tls.shutdown_grace", &self.tls.shutdown_grace)?,
        })
    }

    /// Client session parameters
    pub fn session_config(&self) -> ClientSessionConfig {
        ClientSessionConfig {
            host: self.client.host.clone(),
            port: self.client.port,
            probe: self.client.probe.clone().into_bytes(),
            probe_limit: self.client.probe_limit,
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("Invalid duration for {}: {}", field, value))
}
