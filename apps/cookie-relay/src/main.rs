use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use cookie_relay::{
    auth::AuthGate,
    build_router,
    cli::{self, Cli, Commands},
    config::AppConfig,
    jobs::{JobOrchestrator, JobSettings},
    provider::HttpCredentialProvider,
    refresh::RefreshOrchestrator,
    storage::{InMemoryRefreshStore, RedisRefreshStore, SharedStore},
    telemetry,
    websocket::LiveChannel,
    AppState,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Refresh {
        url,
        file,
        username,
        password,
        interval_secs,
        timeout_secs,
    }) = cli.command
    {
        let _ = telemetry::init_tracing(false);
        match cli::run_refresh_client(
            url,
            file,
            username,
            password,
            Duration::from_secs(interval_secs),
            Duration::from_secs(timeout_secs),
        )
        .await
        {
            Ok(result) => match serde_json::to_string_pretty(&result) {
                Ok(text) => println!("{}", text),
                Err(e) => {
                    eprintln!("failed to render result: {}", e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("refresh failed: {:#}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    if let Err(e) = run_server(cli).await {
        error!("server error: {:#}", e);
        eprintln!("server error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_server(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?
        .with_port_override(cli.port);
    telemetry::init_tracing(config.console_logging)?;

    info!("Starting cookie relay on port {}", config.port);
    info!("Credential provider: {}", config.provider_url);
    if !config.auth_enabled() {
        warn!("basic auth disabled; set username/password to protect the relay");
    }

    let metrics = match telemetry::install_metrics() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("metrics disabled: {:#}", e);
            None
        }
    };

    let store: SharedStore = match &config.redis_url {
        Some(url) => {
            info!("Refresh results stored in Redis");
            Arc::new(RedisRefreshStore::new(url, config.refresh_retention()).await?)
        }
        None => Arc::new(InMemoryRefreshStore::new(config.refresh_retention())),
    };

    let provider = Arc::new(HttpCredentialProvider::new(config.provider_url.clone()));
    let channel = LiveChannel::new();
    let jobs = JobOrchestrator::new(
        provider.clone(),
        channel.clone(),
        JobSettings {
            start_delay: config.live_channel_delay(),
            proxy_port: config.proxy_port,
            verbose: config.console_logging,
        },
    );
    let refresh = RefreshOrchestrator::new(provider, store, config.console_logging);

    let app = build_router(AppState {
        jobs,
        refresh,
        channel,
        auth: AuthGate::from_config(&config),
        metrics,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("cookie relay listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")?;

    info!("cookie relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
