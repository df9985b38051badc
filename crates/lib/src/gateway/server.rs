//! HTTP surface: health probe, status, Telegram webhook, channel restart.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::channels::{ChannelError, TelegramUpdate};
use crate::config::{self, Config};
use crate::init;

use super::runtime::{build_runtime, Runtime, RuntimeOptions};

#[derive(Clone)]
struct GatewayState {
    runtime: Arc<Runtime>,
    port: u16,
    /// Bearer token required on admin routes; `None` when auth mode is none.
    required_token: Option<String>,
}

/// Bearer token the admin routes require: `None` when auth mode is none. Token mode without a
/// token is an error rather than open routes.
fn required_token(config: &Config) -> Result<Option<String>> {
    if config.gateway.auth.mode != config::GatewayAuthMode::Token {
        return Ok(None);
    }
    match config::resolve_gateway_token(config) {
        Some(token) => Ok(Some(token)),
        None => anyhow::bail!(
            "gateway.auth.mode is \"token\" but no token is set (gateway.auth.token or BANOBOT_GATEWAY_TOKEN)"
        ),
    }
}

/// Run the gateway until SIGINT/SIGTERM: build the runtime, start it, serve HTTP, then shut down.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim().to_string();
    let token = required_token(&config)?;
    if !config::is_loopback_bind(&bind) && token.is_none() {
        anyhow::bail!(
            "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or BANOBOT_GATEWAY_TOKEN)",
            bind
        );
    }

    let port = config.gateway.port;
    let runtime = Arc::new(build_runtime(config, &config_path, RuntimeOptions::default()).await?);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    serve(runtime, listener, shutdown_signal()).await
}

/// Start `runtime`, serve on `listener` until `shutdown` resolves, then shut the runtime down.
pub async fn serve(
    runtime: Arc<Runtime>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let port = listener
        .local_addr()
        .map(|a| a.port())
        .unwrap_or(runtime.config.gateway.port);
    let state = GatewayState {
        required_token: required_token(&runtime.config)?,
        runtime: runtime.clone(),
        port,
    };
    let app = router(state);

    runtime.start().await;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server exited");
    runtime.shutdown().await;
    log::info!("gateway stopped");
    served
}

fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/status", get(status_http))
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/channels/:id/restart", post(restart_channel))
        .with_state(state)
}

/// Completes on SIGINT or SIGTERM. A signal handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining");
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    bearer_matches(state.required_token.as_deref(), headers)
}

fn bearer_matches(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|t| t == expected)
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}

/// GET /status: channel states, bus depth, dead letters, active sessions, cron jobs.
async fn status_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        );
    }
    let runtime = &state.runtime;
    let channels = runtime.channels.status().await;
    let dead_letters = runtime.channels.dead_letters();
    let cron = match &runtime.cron {
        Some(cron) => serde_json::to_value(cron.list_jobs().await).unwrap_or_default(),
        None => serde_json::Value::Null,
    };
    (
        StatusCode::OK,
        Json(json!({
            "channels": channels,
            "bus": {
                "inboundDepth": runtime.bus.inbound_depth(),
                "routes": runtime.bus.routes(),
            },
            "activeSessions": runtime.dispatcher().active_sessions(),
            "deadLetters": dead_letters,
            "cron": cron,
        })),
    )
}

/// POST /telegram/webhook: Telegram pushes updates here when the channel runs in webhook mode.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(telegram) = state.runtime.telegram.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(expected) = telegram.webhook_secret() {
        let provided = headers
            .get("X-Telegram-Bot-Api-Secret-Token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected {
            return StatusCode::FORBIDDEN;
        }
    }
    let update: TelegramUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(_) => return StatusCode::BAD_REQUEST,
    };
    if !telegram.accept_update(update).await {
        log::debug!("telegram webhook: update not forwarded");
    }
    // Telegram retries anything but 2xx; a dropped update is not worth a retry storm.
    StatusCode::OK
}

/// POST /channels/:id/restart
async fn restart_channel(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<serde_json::Value>) {
    if !authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        );
    }
    match state.runtime.channels.restart(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true, "channel": id }))),
        Err(e @ ChannelError::Unknown(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(e @ ChannelError::Disabled(_)) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_only_required_in_token_mode() {
        let mut config = Config::default();
        config.gateway.auth.token = Some("s3cret".to_string());
        assert_eq!(required_token(&config).unwrap(), None);
        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        if std::env::var("BANOBOT_GATEWAY_TOKEN").is_err() {
            assert_eq!(required_token(&config).unwrap().as_deref(), Some("s3cret"));
        }
    }

    #[test]
    fn token_mode_without_token_is_rejected() {
        if std::env::var("BANOBOT_GATEWAY_TOKEN").is_ok() {
            return;
        }
        let mut config = Config::default();
        config.gateway.auth.mode = config::GatewayAuthMode::Token;
        config.gateway.auth.token = None;
        let err = required_token(&config).unwrap_err();
        assert!(err.to_string().contains("no token is set"));
    }

    #[test]
    fn bearer_header_checked() {
        let mut headers = HeaderMap::new();
        assert!(bearer_matches(None, &headers));
        assert!(!bearer_matches(Some("abc"), &headers));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(!bearer_matches(Some("abc"), &headers));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert!(bearer_matches(Some("abc"), &headers));
    }
}
