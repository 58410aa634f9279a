//! HTTP and WebSocket surface over the publisher.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::SERVICE_NAME;
use crate::config::ServerConfig;
use crate::pipeline::wait_for_shutdown;
use crate::publisher::Publisher;
use crate::types::{ChartData, Snapshot};

#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub shutdown: watch::Receiver<bool>,
    /// Open WebSocket connections. Internal subscribers are not counted.
    clients: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(publisher: Publisher, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            publisher,
            shutdown,
            clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }
}

/// Holds one slot in the client count for the life of a socket.
struct ClientSlot(Arc<AtomicUsize>);

impl ClientSlot {
    fn claim(clients: &Arc<AtomicUsize>) -> Self {
        clients.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(clients))
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/stats", get(api_stats))
        .route("/api/chart", get(api_chart))
        .route("/api/snapshot", get(api_snapshot))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the dashboard listener on `config.host:config.port`.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = format!("{}:{}", config.host, config.port);
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Serve on a bound listener until shutdown.
pub async fn serve(
    listener: TcpListener,
    publisher: Publisher,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("Serving stats on http://{addr} (WebSocket at /ws)");

    let app = router(AppState::new(publisher, shutdown.clone()));
    let mut stop = shutdown;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { wait_for_shutdown(&mut stop).await })
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

async fn root() -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE_NAME }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "clients": state.client_count(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn api_stats(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.publisher.snapshot();
    Json(json!({ "data": snapshot.entries }))
}

async fn api_chart(State(state): State<AppState>) -> Json<ChartData> {
    Json(state.publisher.snapshot().chart)
}

async fn api_snapshot(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.publisher.snapshot())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let _slot = ClientSlot::claim(&state.clients);
    let AppState {
        publisher,
        mut shutdown,
        clients,
    } = state;
    let mut subscription = publisher.subscribe();
    let id = subscription.id();
    info!(
        "Client {id} connected ({} total)",
        clients.load(Ordering::Relaxed)
    );

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            update = subscription.recv() => {
                let Some(update) = update else { break };
                let text = match serde_json::to_string(&*update) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize update {}: {e}", update.sequence);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) if text == "ping" => {
                    if sender.send(Message::Text("pong".to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => debug!("Client {id} sent {text:?}"),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {id} socket error: {e}");
                    break;
                }
            },
        }
    }

    publisher.unsubscribe(subscription);
    info!(
        "Client {id} disconnected ({} remaining)",
        clients.load(Ordering::Relaxed).saturating_sub(1)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{Aggregator, SharedAggregator};
    use crate::types::{Event, EventId};

    fn state() -> (AppState, SharedAggregator, watch::Sender<bool>) {
        let stats = SharedAggregator::new(Aggregator::default());
        let publisher = Publisher::new(stats.clone(), 8);
        let (tx, rx) = watch::channel(false);
        (AppState::new(publisher, rx), stats, tx)
    }

    fn event() -> Event {
        Event {
            id: EventId::new("0xabc:0xu:2").unwrap(),
            key: "0x1".to_string(),
            participant: "0xu".to_string(),
            coin: Some("BTC".to_string()),
            side: Some("A".to_string()),
            price: Some("100".to_string()),
            size: Some("2".to_string()),
            fee: Some("0.5".to_string()),
            fee_token: Some("USDC".to_string()),
            closed_pnl: None,
            timestamp: None,
            block_number: Some(7),
            liquidation: None,
        }
    }

    #[tokio::test]
    async fn root_names_service() {
        let Json(body) = root().await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], SERVICE_NAME);
    }

    #[tokio::test]
    async fn health_counts_socket_clients_only() {
        let (state, _stats, _tx) = state();
        let _reporter = state.publisher.subscribe();
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["clients"], 0);

        let slot = ClientSlot::claim(&state.clients);
        let Json(body) = health(State(state.clone())).await;
        assert_eq!(body["clients"], 1);

        drop(slot);
        assert_eq!(state.client_count(), 0);
    }

    #[tokio::test]
    async fn stats_endpoint_reflects_ingested_events() {
        let (state, stats, _tx) = state();
        stats.ingest(event());

        let Json(body) = api_stats(State(state.clone())).await;
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["address"], "0x1");
        assert_eq!(data[0]["totalVolumeUsd"], "200");
        assert_eq!(data[0]["tradeCount"], 1);

        let Json(snapshot) = api_snapshot(State(state.clone())).await;
        assert_eq!(snapshot.block_number, Some(7));

        let Json(chart) = api_chart(State(state)).await;
        assert_eq!(chart.totals.trades, 1);
    }
}
