use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::rate_limit::{AdmissionController, Decision, client_identity};

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody {
    error: &'static str,
    message: String,
    retry_after: u64,
}

/// 每个判定结果都带上限流头
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining_whole()));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch()));
}

/// 429 响应，带 `Retry-After` 与 JSON 错误体
pub fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.retry_after_secs();
    let body = RateLimitBody {
        error: "Too Many Requests",
        message: format!("Rate limit exceeded, retry in {} seconds", retry_after),
        retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    apply_rate_limit_headers(headers, decision);
    response
}

pub async fn rate_limit(
    State(limiter): State<Arc<AdmissionController>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    // 从连接信息获取原始IP
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let identity = client_identity(req.headers(), peer);
    let path = req.uri().path().to_string();

    let decision = limiter.admit(&identity, &path);

    if !decision.allowed {
        let user_agent = req
            .headers()
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("-");
        tracing::warn!(
            client = %identity,
            path = %path,
            user_agent,
            retry_after = decision.retry_after_secs(),
            "rate limit exceeded"
        );
        return too_many_requests(&decision);
    }

    let mut response = next.run(req).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}
