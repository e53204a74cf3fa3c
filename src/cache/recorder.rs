use std::time::Duration;

use axum::{
    body::{Body, Bytes, to_bytes},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};

use super::models::CacheEntry;

/// 不随缓存条目保存的响应头
const SKIPPED_HEADERS: [header::HeaderName; 3] = [
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
];

/// 缓冲下游响应，记录状态码、响应头与完整响应体
///
/// 状态码为 `None` 表示尚未记录到任何响应（或响应体读取失败），这种记录永远不会被缓存。
#[derive(Debug, Default)]
pub struct ResponseRecorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// 读取完整响应体并原样重建响应返回给调用方
    ///
    /// 响应体读取失败时返回 502，不把截断的响应当作原状态码返回。
    pub async fn capture(&mut self, response: Response) -> Response {
        let (parts, body) = response.into_parts();
        match to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                self.status = Some(parts.status);
                self.headers = parts.headers.clone();
                self.body = Some(bytes.clone());
                Response::from_parts(parts, Body::from(bytes))
            }
            Err(e) => {
                tracing::error!(status = %parts.status, "failed to buffer response body: {}", e);
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::BAD_GATEWAY;
                response
            }
        }
    }

    /// 只有 2xx、可共享且不超过大小上限的响应才会生成缓存条目
    pub fn to_entry(&self, ttl: Duration, max_body_bytes: usize) -> Option<CacheEntry> {
        let status = self.status?;
        let body = self.body.as_ref()?;

        if !status.is_success() || body.len() > max_body_bytes || !self.is_shareable() {
            return None;
        }

        let headers = self
            .headers
            .iter()
            .filter(|(name, _)| !SKIPPED_HEADERS.contains(*name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Some(CacheEntry::new(status.as_u16(), headers, body.to_vec(), ttl))
    }

    fn is_shareable(&self) -> bool {
        if self.headers.contains_key(header::SET_COOKIE) {
            return false;
        }
        !self
            .headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|d| d.trim().to_ascii_lowercase())
            .any(|d| d == "no-store" || d == "private")
    }
}
