//! The rendezvous relay server binary.

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rendezvous_relay::{
    defaults::{DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT},
    server::{CertConfig, Server, ServerConfig, TlsConfig},
};
use tokio_rustls_acme::{caches::DirCache, AcmeConfig};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Run the rendezvous relay signalling server.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// HTTP listen address.
    #[clap(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)))]
    http_addr: SocketAddr,
    /// HTTPS listen address. Only used together with --hosts.
    #[clap(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTPS_PORT)))]
    https_addr: SocketAddr,
    /// Hostnames for which to request Let's Encrypt certificates. When
    /// empty, the server runs plain HTTP only.
    #[clap(long)]
    hosts: Vec<String>,
    /// Directory for the Let's Encrypt certificate cache.
    #[clap(long)]
    cert_cache: Option<PathBuf>,
    /// Contact email for the Let's Encrypt account.
    #[clap(long)]
    contact: Option<String>,
    /// Use the Let's Encrypt production directory instead of staging.
    #[clap(long, default_value_t = false)]
    prod_acme: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = build_config(cli)?;

    let server = Server::spawn(config).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown().await
}

fn build_config(cli: Cli) -> Result<ServerConfig<std::io::Error>> {
    let tls = if cli.hosts.is_empty() {
        None
    } else {
        let cert_cache = cli
            .cert_cache
            .context("--cert-cache is required with --hosts")?;
        ensure!(
            cert_cache.is_dir() || !cert_cache.exists(),
            "--cert-cache must be a directory"
        );
        let mut acme = AcmeConfig::new(cli.hosts)
            .cache(DirCache::new(cert_cache))
            .directory_lets_encrypt(cli.prod_acme);
        if let Some(contact) = cli.contact {
            acme = acme.contact_push(format!("mailto:{contact}"));
        }
        let state = acme.state();
        let mut server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .context("protocols supported by ring")?
        .with_no_client_auth()
        .with_cert_resolver(state.resolver());
        server_config.alpn_protocols.push(b"http/1.1".to_vec());
        Some(TlsConfig {
            https_bind_addr: cli.https_addr,
            cert: CertConfig::LetsEncrypt { state },
            server_config,
        })
    };

    Ok(ServerConfig {
        http_bind_addr: cli.http_addr,
        tls,
        ..Default::default()
    })
}
