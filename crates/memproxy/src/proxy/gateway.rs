//! Request forwarding pipeline
//!
//! Every request that does not hit a fixed route lands here: the caller is
//! identified, the provider detected, eligible chat requests are rewritten
//! against the session's memory, and the result is forwarded upstream. Any
//! failure along the way is reported as a uniform 502; statuses produced by
//! the upstream itself are relayed unchanged.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{State, rejection::BytesRejection},
    http::{HeaderMap, HeaderValue, Method, Response, StatusCode, Uri, header},
};
use serde_json::Value;
use url::Url;

use super::rewrite::{extract_credential, is_eligible, parse_body, rewrite_messages};
use super::server::AppState;
use crate::error::{ProxyError, Result, create_error_response};
use crate::session::{SessionKey, generate_session_key};

/// Hop-by-hop headers that should not be forwarded in either direction
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "proxy-connection",
    "te",
    "upgrade",
];

/// Request headers recomputed by the HTTP client
const STRIPPED_REQUEST_HEADERS: &[&str] = &["content-length", "accept-encoding"];

/// Response headers that no longer describe the relayed (decoded) body
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "content-encoding"];

/// Methods the forwarding pipeline accepts
fn is_forwarded_method(method: &Method) -> bool {
    [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::PATCH,
    ]
    .contains(method)
}

/// Outbound headers: the caller's headers minus hop-by-hop and
/// client-managed ones. `json_body` forces `content-type: application/json`.
pub fn prepare_request_headers(headers: &HeaderMap, json_body: bool) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || STRIPPED_REQUEST_HEADERS.contains(&name_str) {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }

    if json_body {
        forwarded.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    forwarded
}

/// Headers relayed to the caller. Multi-valued headers such as `set-cookie`
/// are kept intact.
pub fn sanitize_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut relayed = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || STRIPPED_RESPONSE_HEADERS.contains(&name_str) {
            continue;
        }
        relayed.append(name.clone(), value.clone());
    }
    relayed
}

/// Fallback handler: forward anything that is not a fixed route
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response<Body> {
    if !is_forwarded_method(&method) {
        return create_error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            &format!("Method {method} is not supported"),
        );
    }

    let body = match body {
        Ok(body) => body,
        Err(rejection) => return body_rejection_response(&rejection),
    };

    let started = Instant::now();
    let path = uri.path().to_string();
    let credential = extract_credential(&headers);
    let session_key = generate_session_key(&credential);

    let parsed = match parse_body(&body) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(
                session = session_key.short(),
                path = %path,
                "Forwarding body unmodified: {e}"
            );
            None
        }
    };

    let model = parsed
        .as_ref()
        .and_then(|json| json.get("model"))
        .and_then(Value::as_str);
    let provider = state.detector.detect(&path, &credential, model);

    let request = ForwardRequest {
        method,
        path: path.clone(),
        query: uri.query().map(str::to_string),
        headers,
        body,
        parsed,
    };

    match forward(&state, &provider, &session_key, request, started).await {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(
                provider = %provider,
                session = session_key.short(),
                path = %path,
                "Proxy request failed: {e}"
            );
            e.into_response()
        }
    }
}

/// The request body could not be read, usually because it exceeds the
/// router's body limit. The status is kept, the body uses the error envelope.
fn body_rejection_response(rejection: &BytesRejection) -> Response<Body> {
    let status = rejection.status();
    let error_type = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "payload_too_large"
    } else {
        "invalid_request_body"
    };
    tracing::warn!(status = status.as_u16(), "Rejected request body: {}", rejection.body_text());
    create_error_response(status, error_type, &rejection.body_text())
}

struct ForwardRequest {
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
    /// `None` when the body is not valid JSON
    parsed: Option<Value>,
}

async fn forward(
    state: &AppState,
    provider: &str,
    session_key: &SessionKey,
    request: ForwardRequest,
    started: Instant,
) -> Result<Response<Body>> {
    let ForwardRequest {
        method,
        path,
        query,
        headers,
        body,
        parsed,
    } = request;

    let target = state
        .detector
        .get_target_url(provider, &path, query.as_deref())?;

    let (outgoing_body, json_body, original_tokens, compressed_tokens) =
        rewrite_body(state, session_key, &path, parsed, body).await?;

    tracing::debug!(
        provider,
        session = session_key.short(),
        %method,
        "Forwarding to {target}"
    );

    let response = send_upstream(state, method, target, &headers, outgoing_body, json_body).await?;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    if let Some(metrics) = &state.metrics {
        metrics.record_request(
            session_key.as_str(),
            original_tokens,
            compressed_tokens,
            elapsed_ms,
        );
    }

    tracing::info!(
        provider,
        session = session_key.short(),
        status = response.status().as_u16(),
        elapsed_ms = %format!("{elapsed_ms:.1}"),
        original_tokens,
        compressed_tokens,
        "Proxied request"
    );

    Ok(response)
}

/// Apply memory rewriting when the request is eligible.
///
/// Returns the body to send, whether it was re-serialized, and the original
/// and outgoing token counts (zeros for ineligible requests).
async fn rewrite_body(
    state: &AppState,
    session_key: &SessionKey,
    path: &str,
    parsed: Option<Value>,
    body: Bytes,
) -> Result<(Bytes, bool, u64, u64)> {
    let Some(mut json) = parsed.filter(|json| is_eligible(path, json, &state.config.proxy)) else {
        state.sessions.get_or_create(session_key).await;
        return Ok((body, false, 0, 0));
    };

    let messages = match json.get("messages").and_then(Value::as_array) {
        Some(messages) => messages.clone(),
        None => return Ok((body, false, 0, 0)),
    };

    let rewrite = {
        let mut guard = state.sessions.acquire(session_key).await;
        rewrite_messages(&mut guard, &messages, state.config.proxy.recall_limit).await?
    };

    if !rewrite.rewritten {
        return Ok((body, false, rewrite.original_tokens, rewrite.compressed_tokens));
    }

    tracing::debug!(
        session = session_key.short(),
        incoming = messages.len(),
        outgoing = rewrite.messages.len(),
        "Rewrote conversation from memory"
    );

    json["messages"] = Value::Array(rewrite.messages);
    let serialized = serde_json::to_vec(&json)
        .map_err(|e| ProxyError::Serialization(format!("Failed to serialize request: {e}")))?;

    Ok((
        Bytes::from(serialized),
        true,
        rewrite.original_tokens,
        rewrite.compressed_tokens,
    ))
}

async fn send_upstream(
    state: &AppState,
    method: Method,
    target: Url,
    headers: &HeaderMap,
    body: Bytes,
    json_body: bool,
) -> Result<Response<Body>> {
    let mut request = state
        .client
        .request(method, target)
        .headers(prepare_request_headers(headers, json_body));
    if !body.is_empty() {
        request = request.body(body);
    }

    let upstream = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::Upstream(format!("Request timed out: {e}"))
        } else if e.is_connect() {
            ProxyError::Upstream(format!("Failed to connect to upstream: {e}"))
        } else {
            ProxyError::Upstream(format!("Request failed: {e}"))
        }
    })?;

    let status = upstream.status();
    let relayed_headers = sanitize_response_headers(upstream.headers());
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ProxyError::Upstream(format!("Failed to read response body: {e}")))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = relayed_headers;
    Ok(response)
}
