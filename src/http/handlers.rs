//! Request handlers for the rate, release, debug, and health endpoints.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::LIMIT_MAX;
use crate::limiter::{fnv1a32, Decision, NO_CHANGE};

use super::server::AppState;

/// Query parameters accepted by the rate endpoints. Everything arrives as a
/// raw string so that parse failures map to 400 rather than a generic
/// rejection.
#[derive(Debug, Default, Deserialize)]
pub struct RateParams {
    #[serde(rename = "canWait")]
    can_wait: Option<String>,
    #[serde(rename = "maxRequests")]
    max_requests: Option<String>,
    #[serde(rename = "maxRequestsInQueue")]
    max_requests_in_queue: Option<String>,
    /// Loop guard set on forwarded requests ("ik" = internal key routing).
    ik: Option<String>,
}

/// `GET|POST /rate/{key}` - ask for one admission slot.
pub async fn rate(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RateParams>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let key = key.trim().to_string();
    let cid = correlation_id(&headers);

    if key.is_empty() {
        warn!(cid = %cid, "empty key provided");
        return (StatusCode::BAD_REQUEST, "empty key provided").into_response();
    }

    let can_wait = match parse_optional_bool(params.can_wait.as_deref(), false) {
        Ok(v) => v,
        Err(_) => {
            warn!(cid = %cid, key = %key, "failed to parse canWait query parameter");
            return (StatusCode::BAD_REQUEST, "failed to parse canWait query parameter")
                .into_response();
        }
    };

    let max_requests = match parse_optional_i64(params.max_requests.as_deref(), NO_CHANGE) {
        Ok(v) => v,
        Err(_) => {
            warn!(cid = %cid, key = %key, "failed to parse maxRequests query parameter");
            return (StatusCode::BAD_REQUEST, "failed to parse maxRequests query parameter")
                .into_response();
        }
    };
    if max_requests != NO_CHANGE && !state.config.service.requests_can_set_rate {
        warn!(cid = %cid, key = %key, "maxRequests query parameter is disabled");
        return (StatusCode::FORBIDDEN, "maxRequests query parameter is disabled")
            .into_response();
    }
    if max_requests != NO_CHANGE && !(1..=LIMIT_MAX).contains(&max_requests) {
        warn!(cid = %cid, key = %key, "maxRequests out of bounds");
        return (StatusCode::BAD_REQUEST, "maxRequests out of bounds").into_response();
    }

    let max_requests_in_queue =
        match parse_optional_i64(params.max_requests_in_queue.as_deref(), NO_CHANGE) {
            Ok(v) => v,
            Err(_) => {
                warn!(cid = %cid, key = %key, "failed to parse maxRequestsInQueue query parameter");
                return (
                    StatusCode::BAD_REQUEST,
                    "failed to parse maxRequestsInQueue query parameter",
                )
                    .into_response();
            }
        };
    if max_requests_in_queue != NO_CHANGE && !state.config.service.requests_can_mod_queue {
        warn!(cid = %cid, key = %key, "maxRequestsInQueue query parameter is disabled");
        return (StatusCode::FORBIDDEN, "maxRequestsInQueue query parameter is disabled")
            .into_response();
    }
    if max_requests_in_queue != NO_CHANGE && !(0..=LIMIT_MAX).contains(&max_requests_in_queue) {
        warn!(cid = %cid, key = %key, "maxRequestsInQueue out of bounds");
        return (StatusCode::BAD_REQUEST, "maxRequestsInQueue out of bounds").into_response();
    }

    if let Some(resp) =
        maybe_forward(&state, &key, &method, &uri, params.ik.as_deref(), &headers, &cid).await
    {
        return resp;
    }

    // The admission call runs in its own task: when the client disconnects
    // this handler future is dropped, which drops `gone_tx` and trips the
    // give-up signal inside the spawned call, so the parked request is
    // withdrawn instead of holding a queue slot forever.
    let (gone_tx, gone_rx) = oneshot::channel::<()>();
    let limiter = state.limiter.clone();
    let task = tokio::spawn(async move {
        limiter
            .ask_permission(&key, can_wait, max_requests, max_requests_in_queue, async {
                let _ = gone_rx.await;
            })
            .await
    });

    let (decision, req_id) = match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(cid = %cid, error = %e, "admission task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    drop(gone_tx);

    match decision {
        Decision::Approved => (StatusCode::OK, req_id).into_response(),
        Decision::Denied => StatusCode::TOO_MANY_REQUESTS.into_response(),
        // Never actually observed by the client; it already disconnected.
        Decision::ClientGaveUp => client_gave_up_status().into_response(),
    }
}

/// `DELETE /rate/{key}/{id}` - return one admission slot.
pub async fn release(
    State(state): State<AppState>,
    Path((key, id)): Path<(String, String)>,
    Query(params): Query<RateParams>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let key = key.trim().to_string();
    let id = id.trim().to_string();
    let cid = correlation_id(&headers);

    if key.is_empty() {
        warn!(cid = %cid, "empty key provided");
        return (StatusCode::BAD_REQUEST, "empty key provided").into_response();
    }
    if id.is_empty() {
        warn!(cid = %cid, key = %key, "empty id provided");
        return (StatusCode::BAD_REQUEST, "empty id provided").into_response();
    }

    if let Some(resp) =
        maybe_forward(&state, &key, &method, &uri, params.ik.as_deref(), &headers, &cid).await
    {
        return resp;
    }

    state.limiter.release(&key, &id).await;

    StatusCode::OK.into_response()
}

/// `GET /debug` - snapshot every live instance.
pub async fn debug_all(State(state): State<AppState>) -> Response {
    Json(state.limiter.debug_snapshots_all().await).into_response()
}

/// `GET /debug/{key}` - snapshot one instance.
pub async fn debug_key(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.limiter.debug_snapshot(&key).await {
        Some(snap) if snap.found => Json(snap).into_response(),
        Some(_) => (StatusCode::NOT_FOUND, "Key not found").into_response(),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to get debug snapshot, check server logs",
        )
            .into_response(),
    }
}

/// `GET /healthz`
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// When peers are configured and the request has not already been routed
/// (`ik=true`), proxy it to the peer owning the key. Returns `None` when this
/// instance is the owner and the request should be handled locally.
async fn maybe_forward(
    state: &AppState,
    key: &str,
    method: &Method,
    uri: &Uri,
    ik: Option<&str>,
    headers: &HeaderMap,
    cid: &str,
) -> Option<Response> {
    let peers = &state.config.peers;
    if peers.is_empty() || ik == Some("true") {
        return None;
    }

    let owner = &peers[fnv1a32(key.as_bytes()) as usize % peers.len()];
    let owner_host = owner.host_str().unwrap_or_default();
    let request_host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(host_only)
        .unwrap_or_default();
    if owner_host == request_host {
        return None;
    }

    // Rebuild the url against the owner, tagging it so a routing bug cannot
    // bounce the request around forever.
    let mut target = owner.clone();
    target.set_path(uri.path());
    let mut query = String::from("ik=true");
    if let Some(raw) = uri.query() {
        for pair in raw.split('&').filter(|p| !p.starts_with("ik=")) {
            query.push('&');
            query.push_str(pair);
        }
    }
    target.set_query(Some(&query));

    debug!(cid = %cid, key = %key, target = %target, "forwarding to the owning instance");

    let method = reqwest::Method::from_bytes(method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    match state.forward_client.request(method, target).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = resp.text().await.unwrap_or_default();
            Some((status, body).into_response())
        }
        Err(e) => {
            warn!(cid = %cid, key = %key, error = %e, "failed to forward request to the owning instance");
            Some(
                (
                    StatusCode::BAD_GATEWAY,
                    "failed to forward request to the owning instance",
                )
                    .into_response(),
            )
        }
    }
}

/// Status reported internally for a caller that disconnected while waiting.
fn client_gave_up_status() -> StatusCode {
    StatusCode::from_u16(499).expect("499 is a valid status code")
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("fg-{}", uuid::Uuid::new_v4()))
}

fn parse_optional_bool(raw: Option<&str>, default: bool) -> Result<bool, ()> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(trimmed) => trimmed.parse::<bool>().map_err(|_| ()),
    }
}

fn parse_optional_i64(raw: Option<&str>, default: i64) -> Result<i64, ()> {
    match raw.map(str::trim) {
        None | Some("") => Ok(default),
        Some(trimmed) => trimmed.parse::<i64>().map_err(|_| ()),
    }
}

/// Strip the port (and ipv6 brackets) off a host header value.
fn host_only(host_port: &str) -> String {
    let mut host = host_port;
    if let Some(colon) = host.rfind(':') {
        if host[colon + 1..].chars().all(|c| c.is_ascii_digit()) {
            host = &host[..colon];
        }
    }
    host.trim_start_matches('[').trim_end_matches(']').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_bool_parsing() {
        assert_eq!(parse_optional_bool(None, false), Ok(false));
        assert_eq!(parse_optional_bool(Some(""), true), Ok(true));
        assert_eq!(parse_optional_bool(Some("true"), false), Ok(true));
        assert_eq!(parse_optional_bool(Some(" false "), true), Ok(false));
        assert!(parse_optional_bool(Some("yes"), false).is_err());
    }

    #[test]
    fn optional_i64_parsing() {
        assert_eq!(parse_optional_i64(None, NO_CHANGE), Ok(NO_CHANGE));
        assert_eq!(parse_optional_i64(Some("42"), NO_CHANGE), Ok(42));
        assert_eq!(parse_optional_i64(Some(" -7 "), NO_CHANGE), Ok(-7));
        assert!(parse_optional_i64(Some("abc"), NO_CHANGE).is_err());
        assert!(parse_optional_i64(Some("1.5"), NO_CHANGE).is_err());
    }

    #[test]
    fn host_only_strips_ports_and_brackets() {
        assert_eq!(host_only("example.com:8080"), "example.com");
        assert_eq!(host_only("example.com"), "example.com");
        assert_eq!(host_only("[::1]:8080"), "::1");
        assert_eq!(host_only("node-a"), "node-a");
        // A trailing segment that is not numeric is part of the host.
        assert_eq!(host_only("weird:host"), "weird:host");
    }
}
