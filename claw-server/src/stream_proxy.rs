//! Thin reverse proxy from `/stream/*` to an external MediaMTX WHEP/HLS
//! origin, grounded in `app/api/stream_proxy.py` / `app/api/hls_proxy.py`.
//! GET-only passthrough — not a general-purpose proxy, just enough to let
//! a browser pull video through the same origin as the rest of the API.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// Headers the upstream is allowed to set on the proxied response. Mirrors
/// `stream_proxy.py`'s explicit allow-list rather than forwarding
/// everything blindly.
const FORWARDED_RESPONSE_HEADERS: &[&str] =
    &["content-type", "cache-control", "access-control-allow-origin", "access-control-expose-headers"];

pub async fn proxy_stream(State(state): State<AppState>, Path(path): Path<String>) -> Response {
    let Some(base_url) = state.stream_base_url() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "streaming is not configured").into_response();
    };
    let upstream_url = format!("{base_url}/{path}");

    match state.http_client.get(&upstream_url).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut headers = HeaderMap::new();
            for name in FORWARDED_RESPONSE_HEADERS {
                if let Some(value) = resp.headers().get(*name) {
                    if let Ok(value) = HeaderValue::from_bytes(value.as_bytes()) {
                        headers.insert(*name, value);
                    }
                }
            }
            let body = Body::from_stream(resp.bytes_stream());
            (status, headers, body).into_response()
        }
        Err(e) if e.is_connect() => {
            tracing::warn!(%upstream_url, "stream proxy upstream connection refused");
            (StatusCode::BAD_GATEWAY, "stream origin unreachable").into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, %upstream_url, "stream proxy request failed");
            (StatusCode::BAD_GATEWAY, "stream origin error").into_response()
        }
    }
}
