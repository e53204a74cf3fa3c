use std::fmt;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};

use crate::utils::unix_now_millis;

pub const X_CACHE_HIT: &str = "x-cache-hit";
pub const X_CACHE_SOURCE: &str = "x-cache-source";
pub const X_CACHE_AGE: &str = "x-cache-age";

/// 未命中时 `X-Cache-Source` 的取值
pub const ORIGIN_SOURCE: &str = "origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    Local,
    Remote,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::Local => "local",
            CacheSource::Remote => "remote",
        }
    }
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 缓存的响应快照，写入后不再修改，只会整体替换
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Unix 毫秒
    pub cached_at_ms: i64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>, ttl: Duration) -> Self {
        Self {
            status,
            headers,
            body,
            cached_at_ms: unix_now_millis(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn age(&self) -> Duration {
        let elapsed = unix_now_millis().saturating_sub(self.cached_at_ms).max(0);
        Duration::from_millis(elapsed as u64)
    }

    /// 剩余存活时间，已过期为零
    pub fn remaining_ttl(&self) -> Duration {
        self.ttl().saturating_sub(self.age())
    }

    /// 重建响应并附加缓存命中头
    pub fn to_response(&self, source: CacheSource) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => tracing::warn!(header = %name, "dropping unrepresentable cached header"),
            }
        }

        headers.insert(X_CACHE_HIT, HeaderValue::from_static("true"));
        headers.insert(X_CACHE_SOURCE, HeaderValue::from_static(source.as_str()));
        headers.insert(X_CACHE_AGE, HeaderValue::from(self.age().as_secs()));
        response
    }
}

/// 未命中的可缓存请求也带上缓存状态头
pub fn mark_miss(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(X_CACHE_HIT, HeaderValue::from_static("false"));
    headers.insert(X_CACHE_SOURCE, HeaderValue::from_static(ORIGIN_SOURCE));
}
