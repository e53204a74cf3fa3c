use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::error;

/// 记录下游返回的 5xx，不修改响应
pub async fn log_errors(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    if response.status().is_server_error() {
        error!(
            %method,
            path = %path,
            status = %response.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Server error occurred"
        );
    }
    response
}
