//! HTTP routes for the live server.
//!
//! - `/ws/world/:world_id/` - WebSocket endpoint, one [`Consumer`] per socket
//! - `/health`, `/ready` - health checks
//! - `/metrics` - Prometheus exposition
//!
//! Each socket is split into a reader task feeding text frames to the
//! consumer and a writer task draining its outbound queue.

use crate::consumer::{Consumer, Outbound};
use crate::models::World;
use crate::observability::health_router;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use common::types::WorldId;
use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

/// Frames queued for a slow client before the consumer waits.
const OUTBOUND_CAPACITY: usize = 256;

/// Client frames queued before the reader waits.
const INBOUND_CAPACITY: usize = 32;

/// State for the WebSocket handler.
#[derive(Clone)]
pub struct SocketState {
    pub app: Arc<AppState>,
    /// Cancelled on shutdown; every connection holds a child token.
    pub shutdown: CancellationToken,
}

/// Build the application routes.
pub fn build_routes(
    state: Arc<AppState>,
    metrics_handle: PrometheusHandle,
    shutdown: CancellationToken,
) -> Router {
    let health = health_router(state.health.clone());

    let metrics_routes = Router::new().route(
        "/metrics",
        get(move || {
            let handle = metrics_handle.clone();
            async move { handle.render() }
        }),
    );

    let socket_routes = Router::new()
        .route("/ws/world/:world_id/", get(socket_handler))
        .route("/ws/world/:world_id", get(socket_handler))
        .with_state(SocketState {
            app: state,
            shutdown,
        });

    socket_routes
        .merge(health)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

async fn socket_handler(
    Path(world_id): Path<String>,
    State(state): State<SocketState>,
    ws: WebSocketUpgrade,
) -> Response {
    let world_id = WorldId::new(world_id);
    let world = match state.app.repository.get_world(&world_id).await {
        Ok(Some(world)) => Arc::new(world),
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(target: "live.routes", world_id = %world_id, error = %e, "Failed to load world");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    ws.on_upgrade(move |socket| serve_socket(socket, state, world))
}

async fn serve_socket(socket: WebSocket, state: SocketState, world: Arc<World>) {
    let (out_tx, mut out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (consumer, events) = match Consumer::connect(state.app.clone(), world, out_tx).await {
        Ok(connected) => connected,
        Err(e) => {
            error!(target: "live.routes", error = %e, "Failed to open connection");
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();
    let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match message {
                Outbound::Frame(frame) => {
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    // Peer may have gone already.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            match message {
                Message::Text(text) => {
                    if in_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    consumer
        .run(in_rx, events, state.shutdown.child_token())
        .await;

    reader.abort();
    if let Err(e) = writer.await {
        debug!(target: "live.routes", error = %e, "Socket writer ended abnormally");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repositories::InMemoryRepository;
    use crate::store::{MemoryStore, SharedStore};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn app_state() -> Arc<AppState> {
        let vars: HashMap<String, String> =
            [("REDIS_URL".to_string(), "memory://".to_string())].into();
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        Arc::new(
            AppState::new(
                Config::from_vars(&vars).unwrap(),
                Arc::new(InMemoryRepository::new()),
                vec![store],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_recorded_metrics() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        ::metrics::with_local_recorder(&recorder, || {
            crate::observability::metrics::record_auth("success");
            crate::observability::metrics::record_evictions(2);
        });

        let app = build_routes(app_state(), handle, CancellationToken::new());
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains(r#"live_auth_total{outcome="success"} 1"#));
        assert!(text.contains("live_evictions_total 2"));
    }

    #[tokio::test]
    async fn test_health_routes_are_mounted() {
        let state = app_state();
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = build_routes(state.clone(), handle, CancellationToken::new());

        let response = app
            .clone()
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.health.set_ready();
        let response = app
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
