use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use crate::web::api::{AppState, json_error};

pub const API_KEY_HEADER: &str = "x-api-key";

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').next())
                .and_then(|s| IpAddr::from_str(s.trim()).ok())
        })
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

/// Rejects requests over the per-IP budget with 429 and a `Retry-After` in whole seconds.
pub async fn rate_limit_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        let ip = client_ip(&req);
        if let Err(retry_after) = limiter.acquire(ip).await {
            tracing::warn!(%ip, "Rate limit exceeded, retry in {:?}", retry_after);
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            let mut response = json_error("Too many requests", StatusCode::TOO_MANY_REQUESTS);
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(seconds.max(1)));
            return response;
        }
    }
    next.run(req).await
}

/// When an API key is configured, requires it in `X-API-Key` (403 otherwise).
pub async fn api_key_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(expected) = &state.api_key {
        let provided = req.headers().get(API_KEY_HEADER).and_then(|h| h.to_str().ok());
        if provided != Some(expected.as_str()) {
            return json_error(
                "Invalid or missing API key. Provide X-API-Key header.",
                StatusCode::FORBIDDEN,
            );
        }
    }
    next.run(req).await
}
