// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod api;
mod config;
mod dispatcher;
mod registry;
mod supervisor;
#[cfg(test)]
mod testing;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use steam_link::{LogOnDetails, loopback::LoopbackConnector};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    api::{AppState, ConnectionLimits, build_router, serve},
    config::{BotConfig, ConfigLoader},
    dispatcher::{GC_REQUEST_TIMEOUT, LobbyDispatcher},
    registry::{BotRegistry, RegistryError},
};

/// How long in-flight requests get to finish once shutdown starts.
const SERVER_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "lobby_service=debug,steam_link=info,tower_http=info".to_string()
        }))
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        commit = option_env!("GIT_COMMIT").unwrap_or("unknown"),
        build_date = option_env!("BUILD_DATE").unwrap_or("unknown"),
        "dota lobby service starting"
    );

    let config = ConfigLoader::from_env()
        .load()
        .context("failed to load configuration")?;
    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(bind_addr.as_str())
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let root = CancellationToken::new();
    warn!("no Steam network backend configured; bots run against the in-process loopback client");
    let registry = Arc::new(BotRegistry::new(
        Arc::new(LoopbackConnector::new()),
        &config.supervisor,
        root.child_token(),
    ));
    register_bots(&registry, &config.bots).await;

    let dispatcher = Arc::new(LobbyDispatcher::new(registry.clone(), GC_REQUEST_TIMEOUT));
    let state = AppState::new(registry.clone(), dispatcher, config.server.api_key.as_deref());
    if state.auth_enabled() {
        info!("api key authentication enabled");
    } else {
        warn!("no api key configured; authentication is disabled");
    }

    let server_shutdown = root.child_token();
    let mut server = tokio::spawn(serve(
        listener,
        build_router(state),
        ConnectionLimits::default(),
        server_shutdown.clone(),
    ));
    info!(%bind_addr, "lobby service listening");

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        result = &mut server => {
            match result {
                Ok(()) => warn!("http server exited unexpectedly"),
                Err(error) => error!(error = %error, "http server task panicked"),
            }
            root.cancel();
            registry.shutdown().await;
            anyhow::bail!("http server stopped before shutdown was requested");
        }
    }

    server_shutdown.cancel();
    match tokio::time::timeout(SERVER_SHUTDOWN_DEADLINE, &mut server).await {
        Ok(Ok(())) => info!("http server stopped"),
        Ok(Err(error)) => warn!(error = %error, "http server task failed"),
        Err(_) => {
            warn!("http server did not drain in time; aborting");
            server.abort();
        }
    }

    registry.shutdown().await;
    root.cancel();
    info!("shutdown complete");
    Ok(())
}

async fn register_bots(registry: &BotRegistry, bots: &[BotConfig]) {
    let mut registered = 0usize;
    for bot in bots {
        if !bot.enabled {
            info!(username = %bot.username, "bot disabled; skipping");
            continue;
        }
        let credentials = LogOnDetails {
            username: bot.username.clone(),
            password: bot.password.clone(),
            sentry_hash: bot.sentry_hash.clone(),
        };
        match registry.add_bot(credentials).await {
            Ok(_) => registered += 1,
            Err(error @ RegistryError::DuplicateBot(_)) => {
                match registry.get(&bot.username).await {
                    Ok(existing) => warn!(
                        username = %bot.username,
                        state = %existing.state().await,
                        error = %error,
                        "duplicate bot entry ignored; keeping the running session"
                    ),
                    Err(lookup) => {
                        warn!(username = %bot.username, error = %lookup, "failed to add bot")
                    }
                }
            }
            Err(error) => warn!(username = %bot.username, error = %error, "failed to add bot"),
        }
    }
    if registered == 0 {
        warn!("no bots registered; lobby routes will answer 503");
    } else {
        info!(bots = registered, total = registry.len().await, "bots registered");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
