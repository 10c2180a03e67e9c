//! `vantun` binary: client and server entry point.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};

use vantun_core::adaptive::AdaptiveFec;
use vantun_core::bucket::TokenBucket;
use vantun_core::config::{Config, ConfigManager};
use vantun_core::multipath::MultipathSession;
use vantun_core::obfs::{ObfuscatedSession, ObfuscationConfig};
use vantun_core::rate::RateController;
use vantun_core::server::Server;
use vantun_core::session::{Session, SessionConfig};
use vantun_core::telemetry::ConnectionSampler;
use vantun_core::tls::{
    build_client_config, build_server_config, generate_self_signed, load_certs, load_key,
    ClientVerification,
};

#[derive(Parser, Debug)]
#[command(name = "vantun", about = "Adaptive QUIC tunnel with FEC, multipath and obfuscation")]
struct Args {
    /// Run as server
    #[arg(long)]
    server: bool,

    /// Address to listen on (server) or connect to (client)
    #[arg(long, default_value = "localhost:4242")]
    addr: String,

    /// Path to JSON configuration file (overrides the flags above)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable multipath
    #[arg(long)]
    multipath: bool,

    /// Enable obfuscation
    #[arg(long)]
    obfs: bool,

    /// Number of FEC data shards
    #[arg(long, default_value_t = 10)]
    fec_data: usize,

    /// Number of FEC parity shards
    #[arg(long, default_value_t = 3)]
    fec_parity: usize,

    /// TLS certificate chain (PEM); the server self-signs when omitted
    #[arg(long)]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// TLS server name the client verifies against
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Skip TLS certificate verification (INSECURE, testing only)
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("vantun: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let manager = match &args.config {
        Some(path) => Some(ConfigManager::new(path).context("loading config file")?),
        None => None,
    };
    let config = match &manager {
        Some(manager) => manager.current(),
        None => Config {
            server: args.server,
            address: args.addr.clone(),
            log_level: args.log_level.clone(),
            multipath: args.multipath,
            obfs: args.obfs,
            fec_data: args.fec_data,
            fec_parity: args.fec_parity,
            ..Config::default()
        },
    };
    config.validate()?;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, reload_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(manager) = &manager {
        manager.start(move |level| {
            let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
            if reload_handle.reload(filter).is_err() {
                eprintln!("vantun: failed to apply log level {level}");
            }
        });
    }

    let shutdown = shutdown_signal();

    let bucket = Arc::new(TokenBucket::new(
        config.token_bucket_rate,
        config.token_bucket_capacity,
    ));
    let adaptive = Arc::new(
        AdaptiveFec::new(config.fec_data, config.fec_parity, 1, 10)
            .context("building adaptive fec")?,
    );
    let obfs = ObfuscationConfig {
        enabled: config.obfs,
        ..ObfuscationConfig::default()
    };

    let result = if config.server {
        run_server(&args, &config, obfs, shutdown).await
    } else {
        run_client(&args, &config, bucket, adaptive, obfs).await
    };

    if let Some(manager) = &manager {
        manager.stop().await;
    }
    // Give spawned loops a moment to flush their logs.
    tokio::time::sleep(Duration::from_secs(1)).await;
    result
}

async fn run_server(
    args: &Args,
    config: &Config,
    obfs: ObfuscationConfig,
    shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let (certs, key) = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => (load_certs(cert)?, load_key(key)?),
        _ => {
            info!("no certificate supplied, generating a self-signed one");
            generate_self_signed(&["localhost"])?
        }
    };
    let server_config = build_server_config(certs, key)?;
    let addr = tokio::net::lookup_host(config.address.as_str())
        .await
        .context("resolving listen address")?
        .next()
        .context("listen address resolved to nothing")?;

    let server = Arc::new(Server::bind(addr, server_config, obfs)?);
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let _ = shutdown.await;
    info!("shutting down");
    server.shutdown().await;
    let _ = runner.await;
    Ok(())
}

async fn run_client(
    args: &Args,
    config: &Config,
    bucket: Arc<TokenBucket>,
    adaptive: Arc<AdaptiveFec>,
    obfs: ObfuscationConfig,
) -> Result<()> {
    let verification = if args.insecure {
        ClientVerification::Insecure
    } else {
        ClientVerification::WebpkiRoots
    };
    let client = build_client_config(&verification)?;
    let mut session_config = SessionConfig::new(config.address.clone(), client);
    session_config.server_name = args.server_name.clone();

    let controller = Arc::new(RateController::new(bucket, Some(adaptive.clone())));

    if config.multipath {
        let multipath = MultipathSession::new(
            session_config,
            Some(controller.clone()),
            Some(adaptive),
        );
        multipath
            .add_path(&config.address)
            .await
            .context("adding primary path")?;
        controller.start();

        let mut stream = multipath.open_stream().await.context("opening stream")?;
        exchange(&mut stream, b"Hello from VANTUN multipath client!").await?;

        multipath.close().await;
        controller.stop().await;
        return Ok(());
    }

    let session = Session::connect(&session_config)
        .await
        .context("establishing session")?;
    controller.attach_sampler(Arc::new(ConnectionSampler::new(session.connection())));
    controller.start();

    if config.obfs {
        let session = ObfuscatedSession::new(session, obfs);
        let mut stream = session
            .open_stream(vantun_core::streams::StreamKind::Interactive)
            .await
            .context("opening obfuscated stream")?;
        exchange(&mut stream, b"Hello from VANTUN obfuscated client!").await?;
        session.close("client done").await;
    } else {
        let mut stream = session
            .open_interactive()
            .await
            .context("opening interactive stream")?;
        exchange(&mut stream, b"Hello from VANTUN client!").await?;
        session.close("client done").await;
    }

    controller.stop().await;
    Ok(())
}

// Send one message and print the server's echo.
async fn exchange(
    stream: &mut Box<dyn vantun_core::transport::TunnelStream>,
    message: &[u8],
) -> Result<()> {
    stream.write_all(message).await.context("sending message")?;
    stream.flush().await?;

    let mut echo = vec![0u8; message.len()];
    stream.read_exact(&mut echo).await.context("reading echo")?;
    info!(echo = %String::from_utf8_lossy(&echo), "received echo");
    println!("{}", String::from_utf8_lossy(&echo));
    let _ = stream.shutdown().await;
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
fn shutdown_signal() -> tokio::sync::oneshot::Receiver<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
            let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.expect("Ctrl+C handler");
            info!("received Ctrl+C, shutting down");
        }
        let _ = tx.send(());
    });

    rx
}
