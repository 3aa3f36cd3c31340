//! Process entrypoint: wires `/ws/client` and `/ws/gateway` behind axum,
//! with CSWSH-protected upgrades (spec §4.3, §4.11), a `/health` probe, and
//! the background sweeps the connection tables and rate limiter need.

use std::net::SocketAddr;
use std::sync::Arc;

use agentim_server::AppState;
use agentim_server::ws::{handle_client_connection, handle_gateway_connection};
use axum::Router;
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::http::header::{HOST, ORIGIN};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    agentim_config::load_dotenv();

    let config = agentim_config::ServerConfig::from_env()?;
    let bind_addr: SocketAddr = config.bind_addr.parse()?;
    let sweep_interval = config.rate_limit.sweep_interval;
    let app = AppState::new(config);

    {
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                ticker.tick().await;
                app.sweep_rate_limits();
            }
        });
    }

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/ws/client", get(client_ws_upgrade_handler))
        .route("/ws/gateway", get(gateway_ws_upgrade_handler))
        .with_state(Arc::clone(&app));

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = %bind_addr, "agentim-server listening");
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    app.tasks.cancel_all();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

async fn health_handler(State(app): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": app.client_count(),
        "activeTasks": app.tasks.active_count(),
    }))
}

/// Rejects cross-origin browser upgrades while letting non-browser clients
/// (which omit `Origin`) through, per the CSWSH guard in spec §4.11.
fn is_same_origin(origin: &str, host: &str) -> bool {
    let origin_host = origin.split("://").nth(1).unwrap_or(origin).split('/').next().unwrap_or("");

    fn strip_port(h: &str) -> &str {
        if h.starts_with('[') {
            h.rsplit_once("]:").map_or(h, |(addr, _)| addr).trim_start_matches('[').trim_end_matches(']')
        } else {
            h.rsplit_once(':').map_or(h, |(addr, _)| addr)
        }
    }
    fn get_port(h: &str) -> Option<&str> {
        if h.starts_with('[') { h.rsplit_once("]:").map(|(_, p)| p) } else { h.rsplit_once(':').map(|(_, p)| p) }
    }

    let origin_port = get_port(origin_host);
    let host_port = get_port(host);
    let oh = strip_port(origin_host);
    let hh = strip_port(host);
    let is_loopback = |h: &str| matches!(h, "localhost" | "127.0.0.1" | "::1") || h.ends_with(".localhost");

    (oh == hh || (is_loopback(oh) && is_loopback(hh))) && origin_port == host_port
}

fn reject_cross_origin(headers: &axum::http::HeaderMap, remote: SocketAddr) -> Option<impl IntoResponse> {
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok())?;
    let host = headers.get(HOST).and_then(|v| v.to_str().ok()).unwrap_or("");
    if is_same_origin(origin, host) {
        return None;
    }
    warn!(origin, host, %remote, "rejected cross-origin WebSocket upgrade");
    Some((StatusCode::FORBIDDEN, "cross-origin WebSocket connections are not allowed"))
}

async fn client_ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: axum::http::HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(rejection) = reject_cross_origin(&headers, remote) {
        return rejection.into_response();
    }
    ws.on_upgrade(move |socket| handle_client_connection(socket, app)).into_response()
}

async fn gateway_ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: axum::http::HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(app): State<Arc<AppState>>,
) -> impl IntoResponse {
    if let Some(rejection) = reject_cross_origin(&headers, remote) {
        return rejection.into_response();
    }
    ws.on_upgrade(move |socket| handle_gateway_connection(socket, app)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_host_different_scheme_is_same_origin() {
        assert!(is_same_origin("https://localhost:8080", "localhost:8080"));
    }

    #[test]
    fn loopback_variants_are_treated_as_same_origin() {
        assert!(is_same_origin("http://127.0.0.1:8080", "localhost:8080"));
        assert!(is_same_origin("http://[::1]:8080", "localhost:8080"));
    }

    #[test]
    fn foreign_host_is_rejected() {
        assert!(!is_same_origin("https://attacker.example", "localhost:8080"));
    }

    #[test]
    fn mismatched_port_is_rejected() {
        assert!(!is_same_origin("http://localhost:9999", "localhost:8080"));
    }
}
