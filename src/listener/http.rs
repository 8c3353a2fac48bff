//! HTTP listener: `axum`-based, optionally in "redborder_uri" mode where
//! the path itself carries `(sensor_uuid, topic)` (spec.md §4.1/§6).
//!
//! `Content-Encoding: deflate` bodies are inflated (bounded to 512 KiB,
//! matching the spec's internal inflate window) before being handed to the
//! decoder. Non-POST requests get 405 with `Allow: POST`.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use axum::body::Bytes;
use flate2::read::DeflateDecoder;
use tower_http::trace::TraceLayer;

use crate::decoder::{ConnMeta, Decoder};
use crate::dispatch::Dispatcher;
use crate::error::{DecodeError, ListenerError};

use super::{is_blacklisted, ConnectionDriver, ListenerHandle};

const MAX_INFLATED: u64 = 512 * 1024;

#[derive(Clone)]
struct HttpState {
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    blacklist: Arc<Vec<String>>,
    max_buffer: usize,
}

pub async fn spawn(
    port: u16,
    decoder: Arc<dyn Decoder>,
    dispatcher: Arc<Dispatcher>,
    blacklist: Arc<Vec<String>>,
    redborder_uri: bool,
    max_buffer: usize,
) -> Result<ListenerHandle, ListenerError> {
    let state = HttpState {
        decoder,
        dispatcher,
        blacklist,
        max_buffer,
    };

    let app = if redborder_uri {
        Router::new()
            .route("/rbdata/{uuid}/{topic}", any(handle_rbdata))
            .fallback(|| async { StatusCode::BAD_REQUEST })
            .with_state(state)
    } else {
        Router::new().route("/", any(handle_plain)).with_state(state)
    }
    .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let task = tokio::spawn(async move {
        let service = app.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(err) = axum::serve(listener, service).await {
            tracing::error!(error = %err, "http: listener exited");
        }
    });
    Ok(ListenerHandle::new(port, task))
}

async fn handle_plain(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process(state, addr, method, &headers, body, None, None).await
}

async fn handle_rbdata(
    State(state): State<HttpState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((uuid, topic)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process(state, addr, method, &headers, body, Some(uuid), Some(topic)).await
}

async fn process(
    state: HttpState,
    addr: SocketAddr,
    method: Method,
    headers: &HeaderMap,
    body: Bytes,
    sensor_uuid: Option<String>,
    topic: Option<String>,
) -> Response {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, [("Allow", "POST")]).into_response();
    }

    let ip = addr.ip().to_string();
    if is_blacklisted(&ip, &state.blacklist) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let body = match inflate_if_needed(headers, &body) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "http: failed to inflate body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let meta = ConnMeta {
        client_ip: ip,
        topic,
        sensor_uuid,
    };
    let mut driver = match ConnectionDriver::new(state.decoder.as_ref(), &meta, state.max_buffer) {
        Ok(driver) => driver,
        Err(ListenerError::Decode(DecodeError::AuthFailed(_))) => {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        Err(ListenerError::Decode(DecodeError::AuthzFailed(_))) => {
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(err) => {
            tracing::warn!(error = %err, "http: session create failed");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if let Err(err) = driver.feed(&body, &state.dispatcher).await {
        tracing::warn!(error = %err, "http: feed failed");
        return StatusCode::BAD_REQUEST.into_response();
    }
    if let Err(err) = driver.finish(&state.dispatcher).await {
        tracing::warn!(error = %err, "http: finish failed");
        return StatusCode::BAD_REQUEST.into_response();
    }
    StatusCode::OK.into_response()
}

fn inflate_if_needed(headers: &HeaderMap, body: &Bytes) -> std::io::Result<Vec<u8>> {
    let is_deflate = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        == Some("deflate");
    if !is_deflate {
        return Ok(body.to_vec());
    }
    let mut decoder = DeflateDecoder::new(&body[..]).take(MAX_INFLATED);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
