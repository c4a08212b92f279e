//! Offline proxy: every incoming request becomes a fetch event.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::application::worker::WorkerHost;
use crate::cache::{
    FetchRequest, LifecycleState, RequestKey, ResponseSnapshot, Served, ServedFrom,
};

pub const CACHE_HEADER: &str = "x-pantry-cache";
pub const STATUS_PATH: &str = "/_pantry/status";

/// Recomputed by the HTTP stack for buffered bodies.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|hop| name.eq_ignore_ascii_case(hop))
}

#[derive(Clone)]
pub struct ProxyState {
    pub host: Arc<WorkerHost>,
}

pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .fallback(proxy)
        .layer(middleware::from_fn(log_responses))
        .with_state(state)
}

/// Bodies above axum's default limit are refused with 413 by the `Bytes`
/// extractor before this handler runs.
async fn proxy(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let origin = &state.host.config().origin;
    let target = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let key = match RequestKey::resolve(method, origin, target) {
        Ok(key) => key,
        Err(err) => {
            warn!(target_path = target, error = %err, "rejected proxy target");
            return (StatusCode::BAD_REQUEST, "Invalid request target").into_response();
        }
    };
    if !key.is_same_origin(origin) {
        warn!(
            target_path = target,
            resolved = %key.url(),
            "rejected cross-origin proxy target"
        );
        return (StatusCode::BAD_REQUEST, "Invalid request target").into_response();
    }

    let request = FetchRequest::new(key)
        .with_headers(forwarded_headers(&headers))
        .with_body(body);

    match state.host.dispatch_fetch(request).settled().await {
        Ok(Ok(served)) => served_response(served),
        Ok(Err(err)) => {
            warn!(error = %err, "network fallback failed");
            (StatusCode::BAD_GATEWAY, "Upstream unavailable").into_response()
        }
        Err(err) => {
            error!(error = %err, "fetch event aborted");
            (StatusCode::INTERNAL_SERVER_ERROR, "Fetch did not complete").into_response()
        }
    }
}

/// End-to-end request headers; `host` is set by the client for the origin.
fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()) && name.as_str() != "host")
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn served_response(served: Served) -> Response {
    let Served { response, source } = served;
    let mut rendered = snapshot_response(response);
    let marker = match source {
        ServedFrom::Cache => "hit",
        ServedFrom::Network => "miss",
    };
    rendered
        .headers_mut()
        .insert(CACHE_HEADER, HeaderValue::from_static(marker));
    rendered
}

fn snapshot_response(snapshot: ResponseSnapshot) -> Response {
    let ResponseSnapshot {
        status,
        headers,
        body,
    } = snapshot;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);

    let target = response.headers_mut();
    for (name, value) in headers {
        if is_hop_by_hop(&name) {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) else {
            continue;
        };
        target.append(name, value);
    }
    response
}

#[derive(Debug, Serialize)]
pub struct StatusBody {
    pub active: Option<String>,
    pub generations: Vec<GenerationStatus>,
}

#[derive(Debug, Serialize)]
pub struct GenerationStatus {
    pub generation: String,
    pub state: LifecycleState,
    pub entries: Option<usize>,
}

async fn status(State(state): State<ProxyState>) -> Response {
    let controller = state.host.controller();
    let mut generations = Vec::new();
    for (generation, phase) in controller.states() {
        let entries = match controller.store().entry_count(&generation).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(generation = %generation, error = %err, "failed to count entries");
                None
            }
        };
        generations.push(GenerationStatus {
            generation: generation.to_string(),
            state: phase,
            entries,
        });
    }

    Json(StatusBody {
        active: controller.active_generation().map(|id| id.to_string()),
        generations,
    })
    .into_response()
}

async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let cache = response
        .headers()
        .get(CACHE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() {
        error!(
            target = "pantry::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            elapsed_ms,
            "request failed"
        );
    } else {
        info!(
            target = "pantry::http::response",
            status = status.as_u16(),
            method = %method,
            path = %uri.path(),
            cache = %cache,
            elapsed_ms,
            "request served"
        );
    }

    response
}
