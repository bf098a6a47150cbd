use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::HeaderValue;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use castcore_protocol::BrokerConfig;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::broker::Broker;
use crate::signaling;

/// Shared application state.
pub struct AppState {
    pub config: BrokerConfig,
    pub broker: Arc<Broker>,
    pub http_client: reqwest::Client,
    pub started_at: std::time::Instant,
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains"),
    );
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "referrer-policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert("x-xss-protection", HeaderValue::from_static("0"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' wss: ws:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/turn-credentials", get(turn_credentials))
        .route("/ws", get(ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(Arc::clone(&state));

    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

/// GET /health - minimal liveness check for load balancers, no auth.
async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /status - broker-wide counts, useful for operators and dashboards.
async fn status(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let status = state.broker.status().await;
    let connection_count = status.broadcasters.len() + status.viewer_count;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "broadcasters": status.broadcasters,
        "viewerCount": status.viewer_count,
        "connectionCount": connection_count,
    }))
}

/// GET /turn-credentials - current ICE server list, merging any dynamic
/// TURN credentials over the static configuration. Never errors: a failed
/// dynamic fetch degrades to the static/STUN-only list.
async fn turn_credentials(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let dynamic = match castcore_protocol::fetch_dynamic_credentials(
        &state.http_client,
        &state.config.ice.dynamic_turn,
    )
    .await
    {
        Ok(entry) => entry,
        Err(castcore_protocol::TurnCredentialError::NotConfigured) => None,
        Err(e) => {
            tracing::warn!(error = %e, "TURN credential fetch failed");
            None
        }
    };

    let servers = castcore_protocol::build_ice_servers(&state.config.ice.static_servers, dynamic);
    Json(json!({ "iceServers": servers }))
}

/// GET /ws - the single unified signaling WebSocket endpoint. Role
/// (broadcaster vs. viewer) is decided by the first message the client sends.
async fn ws_upgrade(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let broker = Arc::clone(&state.broker);
    ws.max_message_size(65_536)
        .on_upgrade(move |socket| signaling::handle_socket(socket, broker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState {
            config: BrokerConfig::default(),
            broker: Broker::new(),
            http_client: reqwest::Client::new(),
            started_at: std::time::Instant::now(),
        })
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["uptime"].is_u64());
    }

    #[tokio::test]
    async fn status_reports_zero_broadcasters_when_empty() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["viewerCount"], 0);
        assert_eq!(json["connectionCount"], 0);
        assert_eq!(json["broadcasters"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn turn_credentials_returns_configured_stun_servers() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/turn-credentials")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["iceServers"].as_array().unwrap().len() >= 1);
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-frame-options").unwrap(),
            "DENY"
        );
        assert!(response.headers().contains_key("content-security-policy"));
    }
}
