//! domain-proxy - Main entry point
//!
//! Serves the configured proxy entries over HTTP and HTTPS until interrupted.
//! SIGHUP reloads entries and certificates from disk.

use anyhow::Result;
use clap::Parser;
use domain_proxy::config::DEFAULT_CERTS_DIR;
use domain_proxy::{CertificateFiles, ProxyConfig, ProxyServer, SqliteStore};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// domain-proxy - A multi-tenant HTTP/HTTPS reverse proxy
#[derive(Parser, Debug)]
#[command(name = "domain-proxy")]
#[command(version = "1.0.0")]
#[command(about = "A multi-tenant HTTP/HTTPS reverse proxy")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Address both listeners bind to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Serve plaintext HTTP only
    #[arg(long, env = "DISABLE_HTTPS", default_value = "false")]
    disable_https: bool,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/proxy.db")]
    db_path: PathBuf,

    /// Directory holding one certificate folder per root domain
    #[arg(long, env = "CERTS_DIR", default_value = DEFAULT_CERTS_DIR)]
    certs_dir: PathBuf,

    /// Log level or filter directives
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Accepts a bare level ("debug") or full directives ("domain_proxy=debug,hyper=warn")
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting domain-proxy v{}", env!("CARGO_PKG_VERSION"));

    let store = SqliteStore::open(&args.db_path)?;
    info!("Database initialized at: {}", store.db_path());

    let config = ProxyConfig {
        bind_address: args.bind_address,
        http_port: args.http_port,
        https_port: args.https_port,
        enable_https: !args.disable_https,
        certs_dir: args.certs_dir,
        certificate_files: CertificateFiles::default(),
    };

    let server = ProxyServer::new(config, Arc::new(store));
    server.start().await?;

    info!(
        "domain-proxy started with {} entries",
        server.list_entries().len()
    );

    wait_for_shutdown(&server).await?;

    info!("Shutting down");
    server.stop().await;

    Ok(())
}

/// Reload on SIGHUP, return on Ctrl-C
#[cfg(unix)]
async fn wait_for_shutdown(server: &ProxyServer) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading");
                if let Err(e) = server.reload().await {
                    error!("Reload failed: {}", e);
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &ProxyServer) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
