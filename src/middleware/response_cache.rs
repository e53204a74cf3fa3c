use std::sync::Arc;

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};

use crate::cache::ResponseCache;

pub async fn response_cache(
    State(cache): State<Arc<ResponseCache>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    cache.handle(req, move |req| next.run(req)).await
}
