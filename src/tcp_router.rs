// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Copyright 2025 MNX Cloud, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tcp_router::admin::{self, AdminState};
use tcp_router::config::load_config;
use tcp_router::{
    ConfigRenderer, Configurer, HaproxyConfigurer, NoopTokenSource, Pruner, Reloader,
    RouteSource, RoutingApiClient, Syncer, TokenSource, UaaTokenFetcher, Updater, Watcher,
};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// # TCP Router - `tcp-router` binary
///
/// Long running daemon that keeps HAProxy's TCP routes in step with the
/// routing API.
///
/// ## Functionality
///
/// This program:
///
/// 1. Loads and validates the TOML configuration
/// 2. Fetches an initial OAuth token, failing fast on bad credentials
/// 3. Subscribes to TCP route events and runs a bulk sync right away and then
///    on every sync interval
/// 4. Prunes backends whose TTL expired
/// 5. Optionally serves the legacy external ports admin endpoint
/// 6. On SIGTERM or SIGINT, stops the above and drains HAProxy
///
/// ## Environment Variables
///
/// - `RUST_LOG`: Set to `debug` to enable debug output
/// - `TCP_ROUTER_CONFIG`: Path to the configuration file
#[derive(Parser, Debug)]
#[command(name = "tcp-router", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TCP_ROUTER_CONFIG")]
    config: PathBuf,
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    info!("TCP Router - HAProxy based TCP routing");

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    let route_source = Arc::new(
        RoutingApiClient::new(
            &config.routing_api.url,
            config.routing_api.skip_tls_verification,
        )
        .context("Failed to create routing API client")?,
    );

    let token_source: Arc<dyn TokenSource> = if config.routing_api.auth_enabled {
        Arc::new(UaaTokenFetcher::new(
            &config.oauth.token_endpoint,
            &config.oauth.client_id,
            &config.oauth.client_secret,
            config.oauth.skip_tls_verification,
        )?)
    } else {
        info!("Routing API authentication is disabled.");
        Arc::new(NoopTokenSource)
    };

    let token = token_source
        .fetch_token(false)
        .await
        .context("Failed to fetch initial OAuth token")?;
    route_source.set_token(&token.access_token);

    let configurer = Arc::new(HaproxyConfigurer::new(
        ConfigRenderer::new(config.backend_tls.clone()),
        Reloader::new(&config.haproxy.reload_script_path),
        &config.haproxy.base_config_path,
        &config.haproxy.config_path,
        config.haproxy.drain_wait(),
    ));
    let updater = Arc::new(Updater::new(
        route_source.clone(),
        token_source.clone(),
        configurer.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (sync_tx, sync_rx) = mpsc::channel(1);
    let mut tasks = JoinSet::new();

    tasks.spawn(Syncer::new(config.intervals.sync(), sync_tx).run(shutdown_rx.clone()));
    tasks.spawn(
        Pruner::new(config.intervals.prune(), updater.clone()).run(shutdown_rx.clone()),
    );
    tasks.spawn(
        Watcher::new(
            route_source,
            token_source,
            updater.clone(),
            sync_rx,
            config.intervals.subscription_retry(),
        )
        .run(shutdown_rx.clone()),
    );

    if let Some(addr) = config.admin.listen_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind admin endpoint to {}", addr))?;
        let state = AdminState {
            updater,
            reservable_ports: Arc::new(config.admin.reservable_ports()?),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = admin::serve(listener, state, shutdown).await {
                error!("Admin endpoint failed: {}", e);
            }
        });
    }

    wait_for_signal().await?;
    info!("Received shutdown signal, stopping.");
    // Receivers only observe the flag, a failed send means everyone is gone
    let _ = shutdown_tx.send(true);

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("Task failed during shutdown: {}", e);
        }
    }

    configurer
        .stop_and_drain()
        .await
        .context("Failed to drain HAProxy")?;
    info!("HAProxy drained, exiting.");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging default to info level
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");
    env_logger::init_from_env(env);

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
