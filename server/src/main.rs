use anyhow::Result;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use cok_shared::ratelimit::DEFAULT_IDLE_EVICTION;
use std::net::SocketAddr;
use tracing::info;

mod config;
mod control;
mod headers;
mod health;
mod ingress;
mod registry;
mod state;
mod tracker;

use config::ServerConfig;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("cok_server=info").init();

    let config = ServerConfig::from_env()?;
    let http_port = config.http_port;
    let base_domain = config.base_domain.clone();
    let state = AppState::new(config);

    let shutdown = state.shutdown.clone();
    let registry_for_shutdown = state.registry.clone();
    let tracker_for_shutdown = state.tracker.clone();
    shutdown.register("drain tunnels", move || {
        let registry = registry_for_shutdown.clone();
        let tracker = tracker_for_shutdown.clone();
        async move {
            for session in registry.list() {
                let owned = session.owned_request_ids();
                tracker.fail_all(&owned, || cok_shared::Error::TransportClosed);
                registry.unregister(session.id);
            }
        }
    });

    {
        let connect_limiter = state.connect_rate_limiter.clone();
        let http_limiter = state.http_rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEFAULT_IDLE_EVICTION);
            loop {
                interval.tick().await;
                connect_limiter.sweep_idle(DEFAULT_IDLE_EVICTION);
                http_limiter.sweep_idle(DEFAULT_IDLE_EVICTION);
            }
        });
    }

    let app = Router::new()
        .route("/tunnel", get(ws_handler))
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .fallback(any(ingress::handler))
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    info!(%addr, domain = %base_domain, "cok-server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    tokio::select! {
        result = serve => result?,
        _ = shutdown.wait_and_run() => {}
    }

    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| control::handle_socket(socket, state, peer.ip().to_string()))
}
