//! securecho binary.
//!
//! `securecho server` accepts TLS connections and echoes every byte back;
//! `securecho client` connects, sends a few probes and prints what comes back.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use securecho_session::{
    ClientMaterial, ClientSession, HandshakeContext, ListenerLoop, ServerMaterial,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::EchoConfig;
use logging::EchoLogFormatter;

/// TLS echo server and probe client
#[derive(Parser, Debug)]
#[command(name = "securecho", version, about = "TLS echo server and probe client")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "securecho.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Disable colored log output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and echo everything back
    Server {
        /// Listen address, e.g. 0.0.0.0:443
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Path to the certificate chain (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Path to the private key (PEM)
        #[arg(long)]
        key: Option<PathBuf>,

        /// Handshake timeout, e.g. 10s
        #[arg(long)]
        handshake_timeout: Option<humantime::Duration>,

        /// Maximum concurrent connections
        #[arg(long)]
        max_connections: Option<usize>,
    },

    /// Connect to a server and send probes
    Client {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(long)]
        port: Option<u16>,

        /// Trust anchors (PEM)
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Skip server certificate verification
        #[arg(long)]
        insecure: bool,

        /// Server name to verify instead of the host
        #[arg(long)]
        sni: Option<String>,

        /// Number of probes to send
        #[arg(long)]
        probes: Option<u32>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_tracing(&args.log_level, args.no_color) {
        eprintln!("Failed to initialise logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting securecho v{}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log_level: &str, no_color: bool) -> Result<()> {
    let env_filter = EnvFilter::new("info")
        .add_directive(format!("securecho={}", log_level).parse()?)
        .add_directive(format!("securecho_session={}", log_level).parse()?);

    let mut formatter = EchoLogFormatter::new("securecho");
    if no_color {
        formatter = formatter.without_color();
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(formatter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
}

async fn run(args: Args) -> Result<()> {
    let mut config = EchoConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Server {
            listen,
            cert,
            key,
            handshake_timeout,
            max_connections,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen.to_string();
            }
            if let Some(cert) = cert {
                config.server.cert_file = cert;
            }
            if let Some(key) = key {
                config.server.key_file = key;
            }
            if let Some(timeout) = handshake_timeout {
                config.server.handshake_timeout = timeout.to_string();
            }
            if let Some(max) = max_connections {
                config.server.max_connections = max;
            }
            run_server(&config).await
        }
        Command::Client {
            host,
            port,
            ca,
            insecure,
            sni,
            probes,
        } => {
            if let Some(host) = host {
                config.client.host = host;
            }
            if let Some(port) = port {
                config.client.port = port;
            }
            if ca.is_some() {
                config.client.ca_file = ca;
            }
            if insecure {
                config.client.insecure = true;
            }
            if sni.is_some() {
                config.client.server_name = sni;
            }
            if let Some(probes) = probes {
                config.client.probe_limit = probes;
            }
            run_client(&config).await
        }
    }
}

async fn run_server(config: &EchoConfig) -> Result<()> {
    let listen = config.listen_addr()?;
    let settings = config.server_settings()?;

    info!(
        "Loading TLS material from cert={:?}, key={:?}",
        config.server.cert_file, config.server.key_file
    );
    let cert_pem = tokio::fs::read_to_string(&config.server.cert_file)
        .await
        .with_context(|| format!("Failed to read certificate file {:?}", config.server.cert_file))?;
    let key_path = config.server.key_file.clone();
    let material = ServerMaterial::with_key_source(cert_pem, move || std::fs::read_to_string(&key_path));

    let ctx = HandshakeContext::server(material)
        .context("Failed to create TLS server configuration")?
        .with_retry_policy(config.retry_policy()?);

    let listener = ListenerLoop::init(listen, ctx, settings)
        .await
        .context("Failed to start listener")?;
    component_info!("server", "Echo server ready on {}", listener.local_addr());

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let stats = listener.run(shutdown).await;
    let echoed: u64 = stats.iter().map(|s| s.bytes_out).sum();
    component_info!(
        "server",
        "Server stopped; closed {} open connections ({} bytes echoed on them)",
        stats.len(),
        echoed
    );
    Ok(())
}

async fn run_client(config: &EchoConfig) -> Result<()> {
    let roots_pem = match &config.client.ca_file {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read CA file {:?}", path))?,
        ),
        None => None,
    };
    let material = ClientMaterial {
        roots_pem,
        server_name: config.client.server_name.clone(),
        insecure_skip_verify: config.client.insecure,
    };
    let ctx = HandshakeContext::client(material)
        .context("Failed to create TLS client configuration")?
        .with_retry_policy(config.retry_policy()?);

    let mut session = ClientSession::new(config.session_config());
    session.start(&ctx).await.with_context(|| {
        format!(
            "Failed to connect to {}:{}",
            config.client.host, config.client.port
        )
    })?;
    component_info!(
        "client",
        "Connected to {}:{} in {:?}",
        config.client.host,
        config.client.port,
        session.stats().connect_time.unwrap_or(Duration::ZERO)
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone())?;

    let stats = session.run(cancel).await;
    component_info!(
        "client",
        "Sent {} probes ({} bytes), received {} bytes; ended: {:?}",
        stats.probes_sent,
        stats.bytes_out,
        stats.bytes_in,
        stats.end
    );
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
    Ok(())
}
