//! Public HTTP ingress.
//!
//! Extract the subdomain from `Host`, look the session up in the
//! registry, track the request, and await its resolution.

use crate::headers;
use crate::state::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header::HOST, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use cok_shared::protocol::HttpRequestMessage;
use cok_shared::protocol::{Frame, MessageType};
use cok_shared::Error;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::warn;
use uuid::Uuid;

/// Request bodies larger than this are rejected with `413`.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub async fn handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();

    if !is_host_allowed(&host, &state.config.allowed_hosts) {
        return (StatusCode::FORBIDDEN, "host not allowed").into_response();
    }

    if state.config.health_check_paths.contains(&path) && extract_subdomain(&host, &state.config.base_domain).is_none() {
        return (StatusCode::OK, axum::Json(serde_json::json!({"status": "healthy"}))).into_response();
    }

    let Some(subdomain) = extract_subdomain(&host, &state.config.base_domain) else {
        return (StatusCode::NOT_FOUND, "no tunnel for this host").into_response();
    };

    let client_ip = peer.ip().to_string();
    if !state.http_rate_limiter.try_consume(&client_ip, 1.0) {
        return (StatusCode::TOO_MANY_REQUESTS, "rate limited").into_response();
    }

    let Some(session) = state.registry.get_by_subdomain(&subdomain) else {
        return (StatusCode::BAD_GATEWAY, "no tunnel registered for this subdomain").into_response();
    };

    let method = req.method().to_string();
    let mut request_headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();
    headers::inject_proxy_headers(&mut request_headers, &client_ip, &host);

    let body_bytes = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b.to_vec(),
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response(),
    };

    let request_id = Uuid::new_v4();
    let message = HttpRequestMessage {
        request_id,
        method,
        path,
        headers: request_headers,
        body: body_bytes,
        remote_address: client_ip,
    };

    let frame = match Frame::encode_json(MessageType::HttpRequest, &message) {
        Ok(f) => f,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "encode error").into_response(),
    };

    session.track_request(request_id);
    let tracked = state.tracker.track(request_id);

    if let Err(e) = session.try_send(frame.encode()) {
        session.untrack_request(request_id);
        state.tracker.fail(request_id, e);
        return match e {
            Error::Backpressure => (StatusCode::SERVICE_UNAVAILABLE, "tunnel backpressure").into_response(),
            _ => (StatusCode::BAD_GATEWAY, "tunnel unavailable").into_response(),
        };
    }

    match tracked.await {
        Ok(response) => build_response(response),
        Err(Error::Timeout) => (StatusCode::GATEWAY_TIMEOUT, "origin did not respond in time").into_response(),
        Err(e) => {
            warn!(error = %e, "request failed");
            (StatusCode::BAD_GATEWAY, "tunnel error").into_response()
        }
    }
}

fn build_response(message: cok_shared::protocol::HttpResponseMessage) -> Response {
    let status = axum::http::StatusCode::from_u16(message.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    let mut has_content_length = false;
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in &message.headers {
            if k.eq_ignore_ascii_case("content-length") {
                has_content_length = true;
            }
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(k.as_bytes()),
                axum::http::HeaderValue::from_str(v),
            ) {
                headers_mut.insert(name, value);
            }
        }
        if !has_content_length {
            if let Ok(value) = axum::http::HeaderValue::from_str(&message.body.len().to_string()) {
                headers_mut.insert(axum::http::header::CONTENT_LENGTH, value);
            }
        }
    }

    match builder.body(Body::from(message.body)) {
        Ok(response) => response,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response(),
    }
}

/// `allowed` of `None` means no restriction; otherwise `host` (with any
/// port stripped) must be a member.
fn is_host_allowed(host: &str, allowed: &Option<HashSet<String>>) -> bool {
    let Some(allowed) = allowed else { return true };
    let host = host.split(':').next().unwrap_or(host);
    allowed.contains(host)
}

fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{base_domain}");
    let stripped = host.strip_suffix(&suffix).or_else(|| {
        if host == base_domain {
            Some("")
        } else {
            None
        }
    })?;
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_subdomain_from_host() {
        assert_eq!(
            extract_subdomain("demo.example.com", "example.com"),
            Some("demo".to_string())
        );
    }

    #[test]
    fn bare_base_domain_has_no_subdomain() {
        assert_eq!(extract_subdomain("example.com", "example.com"), None);
    }

    #[test]
    fn unrelated_host_has_no_subdomain() {
        assert_eq!(extract_subdomain("evil.com", "example.com"), None);
    }

    #[test]
    fn strips_port_before_matching() {
        assert_eq!(
            extract_subdomain("demo.example.com:8080", "example.com"),
            Some("demo".to_string())
        );
    }

    #[test]
    fn no_allow_list_permits_any_host() {
        assert!(is_host_allowed("anything.example.com", &None));
    }

    #[test]
    fn allow_list_rejects_unlisted_host() {
        let allowed = Some(["demo.example.com".to_string()].into_iter().collect());
        assert!(!is_host_allowed("evil.example.com", &allowed));
    }

    #[test]
    fn allow_list_accepts_listed_host_ignoring_port() {
        let allowed = Some(["demo.example.com".to_string()].into_iter().collect());
        assert!(is_host_allowed("demo.example.com:8080", &allowed));
    }
}
