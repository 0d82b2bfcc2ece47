use std::{collections::BTreeMap, convert::Infallible, net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        body::Bytes,
        extract::{DefaultBodyLimit, Path, State},
        http::{HeaderMap, Method, Uri},
        response::{
            IntoResponse, Response,
            sse::{Event, Sse},
        },
        routing::{get, post},
    },
    futures::StreamExt,
    tokio_stream::wrappers::ReceiverStream,
    tower_http::{
        cors::{Any, CorsLayer},
        limit::RequestBodyLimitLayer,
        trace::TraceLayer,
    },
    tracing::{debug, info},
};

use {
    brainproxy_common::TenantId,
    brainproxy_config::BrainProxyConfig,
    brainproxy_protocol::ChatCompletionRequest,
};

use crate::{
    error::ProxyError,
    proxy::ProxyResponse,
    state::{AppState, build_proxy},
};

/// Build the HTTP router. `body_limit` caps request bodies in bytes.
pub fn build_app(state: AppState, body_limit: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/{tenant}/chat/completions", post(chat_completions_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind, serve until Ctrl-C, then drain in-flight requests.
pub async fn start_server(config: &BrainProxyConfig) -> anyhow::Result<()> {
    let proxy = Arc::new(build_proxy(config).await?);
    let body_limit = config.server.body_limit_mb.saturating_mul(1024 * 1024);
    let app = build_app(AppState::new(proxy), body_limit);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, upstream = %config.upstream.base_url, "brainproxy listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": state.version,
    }))
}

async fn chat_completions_handler(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match chat_completions(state, tenant, method, uri, headers, body).await {
        Ok(response) => response,
        Err(e) => {
            debug!(status = %e.status(), error = %e, "request failed");
            e.into_response()
        },
    }
}

async fn chat_completions(
    state: AppState,
    tenant: String,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    state
        .proxy
        .authorize(&tenant, method.as_str(), uri.path(), header_map(&headers))
        .await?;

    let tenant = TenantId::parse(tenant)?;
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid request body: {e}")))?;

    match state.proxy.handle(&tenant, request).await? {
        ProxyResponse::Buffered { body, .. } => Ok(Json(body).into_response()),
        ProxyResponse::Streaming { frames, .. } => {
            let events = ReceiverStream::new(frames)
                .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.payload())));
            Ok(Sse::new(events).into_response())
        },
    }
}

/// Lower-cased header names to their UTF-8 values; others are skipped.
fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}
