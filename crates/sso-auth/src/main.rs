use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sso_auth::config::AuthConfig;
use sso_auth::http::{self, AppContext};
use sso_auth::providers;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sso-auth", version, about = "SSO authenticator service")]
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
        error!("sso-auth shut down with error: {err:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = AuthConfig::from_env().context("configuration rejected")?;
    if cli.config_check {
        println!("configuration ok");
        return Ok(());
    }

    match (&config.statsd_host, config.statsd_port) {
        (Some(host), Some(port)) => info!(%host, port, "statsd sink configured"),
        _ => info!("no statsd sink configured; metrics stay in-process"),
    }

    let backchannel_http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .context("failed to build provider HTTP client")?;
    let (provider, groups_cache) =
        providers::build(&config, backchannel_http).context("failed to build provider")?;

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let context = Arc::new(AppContext::new(config, provider).context("failed to build context")?);

    let router = http::router(context);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "authenticator listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    if let Some(cache) = groups_cache {
        cache.stop();
    }

    Ok(())
}
