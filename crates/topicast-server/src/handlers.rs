//! HTTP and WebSocket handlers for the topicast server.
//!
//! This module is the transport adapter around the broker: it validates
//! publish requests before they reach the core, and it ties each
//! subscriber's WebSocket lifetime to an attach/drain/detach cycle.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use topicast_core::{Broker, BrokerConfig};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The message broker. Payloads are the validated JSON bodies.
    pub broker: Broker<Bytes>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let broker_config = BrokerConfig {
            conduit_capacity: config.limits.conduit_capacity,
            auto_delete_empty_topics: true,
        };

        Self {
            broker: Broker::with_config(broker_config),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route("/subscribe", get(subscribe_handler))
        .route("/publish", post(publish_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("topicast server listening on {}", addr);
    info!("Subscribe endpoint: ws://{}/subscribe", addr);
    info!("Publish endpoint: http://{}/publish", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "topics": stats.topic_count,
        "subscriptions": stats.subscription_count,
    }))
}

/// Topic query parameter shared by both endpoints.
#[derive(Debug, Deserialize)]
struct TopicParams {
    topic: Option<String>,
}

/// Build a rejection response, recording it in metrics.
fn reject(status: StatusCode, reason: &'static str, detail: &str) -> Response {
    metrics::record_rejection(reason);
    (status, Json(serde_json::json!({ "error": detail }))).into_response()
}

/// WebSocket upgrade handler for `/subscribe`.
///
/// The topic is validated before any subscription is created.
async fn subscribe_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<TopicParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(topic) = params.topic.filter(|t| !t.is_empty()) else {
        warn!("Subscribe request without topic");
        return reject(
            StatusCode::BAD_REQUEST,
            "missing_topic",
            "Please include the topic query parameter",
        );
    };

    ws.on_upgrade(move |socket| handle_subscriber(socket, topic, state))
}

/// Drive one subscriber connection: attach, drain, detach.
///
/// Every exit path falls through to the detach at the bottom, so the
/// subscription is always unlinked before the socket is dropped.
async fn handle_subscriber(socket: WebSocket, topic: String, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut sub = match state.broker.attach(&topic) {
        Ok(sub) => sub,
        Err(e) => {
            // Unreachable with a validated topic, but never poke a hole
            // in the connection handler over it.
            error!(topic = %topic, error = %e, "Attach failed");
            return;
        }
    };

    debug!(topic = %topic, subscription = %sub.id(), "Subscriber attached");
    metrics::record_subscription();
    metrics::set_active_topics(state.broker.stats().topic_count);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Forward published payloads to the client.
            payload = sub.recv() => {
                match payload {
                    Some(body) => {
                        // The payload is the JSON document validated at
                        // publish time; forward it verbatim.
                        let text = String::from_utf8_lossy(&body).into_owned();
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            warn!(subscription = %sub.id(), error = %e, "Write failed");
                            break;
                        }
                        metrics::record_delivery(body.len());
                    }
                    None => {
                        debug!(subscription = %sub.id(), "Conduit closed");
                        break;
                    }
                }
            }

            // Watch the client side for close or failure.
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        debug!(subscription = %sub.id(), "Received close frame");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        // Subscribers have nothing to say; ignore.
                    }
                    Some(Err(e)) => {
                        warn!(subscription = %sub.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(subscription = %sub.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: unlink from the registry on every exit path.
    state.broker.detach(&sub);
    metrics::set_active_topics(state.broker.stats().topic_count);

    debug!(topic = %topic, subscription = %sub.id(), "Subscriber detached");
}

/// Handler for `POST /publish`.
///
/// Each validation failure returns immediately; the broker only ever
/// sees well-formed JSON on a named topic.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TopicParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !is_json_content_type(&headers) {
        warn!("Publish with unsupported content type");
        return reject(
            StatusCode::BAD_REQUEST,
            "content_type",
            "Please confirm your Content-Type is supported; only application/json is accepted",
        );
    }

    let Some(topic) = params.topic.filter(|t| !t.is_empty()) else {
        warn!("Publish request without topic");
        return reject(
            StatusCode::BAD_REQUEST,
            "missing_topic",
            "Please include the topic query parameter",
        );
    };

    if body.is_empty() {
        warn!(topic = %topic, "Publish with empty body");
        return reject(
            StatusCode::BAD_REQUEST,
            "empty_body",
            "Please include a request body",
        );
    }

    if body.len() > state.config.limits.max_message_size {
        warn!(topic = %topic, bytes = body.len(), "Publish body too large");
        return reject(
            StatusCode::PAYLOAD_TOO_LARGE,
            "too_large",
            "Message body exceeds the configured size limit",
        );
    }

    // No schema is imposed on messages; parse only to prove the body is
    // valid JSON before it reaches the broker.
    if let Err(e) = serde_json::from_slice::<serde_json::Value>(&body) {
        warn!(topic = %topic, error = %e, "Publish with malformed JSON");
        return reject(
            StatusCode::BAD_REQUEST,
            "malformed_json",
            "Please ensure your message body is properly formatted JSON",
        );
    }

    let delivered = state.broker.publish(&topic, body.clone());
    metrics::record_publish(body.len());
    metrics::set_dropped_deliveries(state.broker.stats().dropped_deliveries);

    debug!(topic = %topic, recipients = delivered, "Published");

    (
        StatusCode::OK,
        Json(serde_json::json!({ "delivered": delivered })),
    )
        .into_response()
}

/// Check that the request declares a JSON body.
fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(';')
                .next()
                .unwrap_or("")
                .trim()
                .eq_ignore_ascii_case("application/json")
        })
        .unwrap_or(false)
}
