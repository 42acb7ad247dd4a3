use std::net::SocketAddr;
use std::process;

use anyhow::{Context, Result, bail};
use clap::Parser;
use sso_proxy::config::{ProxyConfig, load_upstreams};
use sso_proxy::proxy::{self, ProxyApp};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sso-proxy", version, about = "SSO proxy service")]
struct Cli {
    /// Validate configuration and exit.
    #[arg(long)]
    config_check: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run().await {
        error!("sso-proxy shut down with error: {err:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = ProxyConfig::from_env().context("configuration rejected")?;
    let Some(upstreams_path) = config.upstream_configs.clone() else {
        bail!("missing setting: UPSTREAM_CONFIGS");
    };
    let upstreams = load_upstreams(&upstreams_path, config.tcp_read_timeout)
        .context("upstream configuration rejected")?;

    if cli.config_check {
        println!("configuration ok ({} upstreams)", upstreams.len());
        return Ok(());
    }

    match (&config.statsd_host, config.statsd_port) {
        (Some(host), Some(port)) => info!(%host, port, "statsd sink configured"),
        _ => info!("no statsd sink configured; metrics stay in-process"),
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let app = ProxyApp::new(config, upstreams).context("failed to build proxy")?;

    let router = proxy::router(app);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "proxy listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
