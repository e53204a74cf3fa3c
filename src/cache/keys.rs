//! 缓存键生成
//!
//! 查找键为 `METHOD path?query` 的 SHA-256 摘要，存储键前面再拼上失效范围，
//! 这样本地与远程两层都可以按路径前缀批量失效。

use axum::http::Method;

use crate::utils::sha256_hex;

/// 存储键中范围与摘要之间的分隔符，请求路径中不会出现
pub const SCOPE_SEPARATOR: char = '#';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub digest: String,
    pub scope: String,
}

impl CacheKey {
    pub fn derive(
        method: &Method,
        path: &str,
        query: Option<&str>,
        depth: usize,
        normalize: bool,
    ) -> Self {
        let query = match query {
            Some(q) if normalize => normalize_query(q),
            Some(q) => q.to_string(),
            None => String::new(),
        };
        let raw = format!("{} {}?{}", method, path, query);

        Self {
            digest: sha256_hex(&raw),
            scope: invalidation_scope(path, depth),
        }
    }

    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.scope, SCOPE_SEPARATOR, self.digest)
    }
}

/// 从存储键中取回失效范围
pub fn scope_of(storage_key: &str) -> Option<&str> {
    storage_key.rsplit_once(SCOPE_SEPARATOR).map(|(scope, _)| scope)
}

/// 取路径前 `depth` 段作为失效范围，如 `/api/vehicles/7` → `/api/vehicles`
pub fn invalidation_scope(path: &str, depth: usize) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .take(depth)
        .collect();
    format!("/{}", segments.join("/"))
}

/// `scope` 是否覆盖 `candidate`（按路径段边界的前缀匹配）
pub fn scope_covers(scope: &str, candidate: &str) -> bool {
    if scope == "/" || scope == candidate {
        return true;
    }
    candidate
        .strip_prefix(scope)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// 查询参数按参数名稳定排序，使参数顺序不同的同一请求命中同一条缓存
///
/// 同名参数之间保持原有顺序，`sort=year&sort=price` 与 `sort=price&sort=year` 是不同的请求。
pub fn normalize_query(query: &str) -> String {
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_by_key(|pair| {
        let pair: &str = *pair;
        pair.split_once('=').map_or(pair, |(name, _)| name)
    });
    pairs.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_request_same_key() {
        let a = CacheKey::derive(&Method::GET, "/api/stats", None, 2, true);
        let b = CacheKey::derive(&Method::GET, "/api/stats", None, 2, true);
        assert_eq!(a, b);
        assert_eq!(a.digest.len(), 64);
        assert_eq!(a.scope, "/api/stats");
    }

    #[test]
    fn method_and_query_change_the_digest() {
        let get = CacheKey::derive(&Method::GET, "/api/search", Some("q=x"), 2, true);
        let head = CacheKey::derive(&Method::HEAD, "/api/search", Some("q=x"), 2, true);
        let other = CacheKey::derive(&Method::GET, "/api/search", Some("q=y"), 2, true);
        assert_ne!(get.digest, head.digest);
        assert_ne!(get.digest, other.digest);
    }

    #[test]
    fn parameter_order_only_matters_without_normalization() {
        let a = CacheKey::derive(&Method::GET, "/api/search", Some("b=2&a=1"), 2, true);
        let b = CacheKey::derive(&Method::GET, "/api/search", Some("a=1&b=2"), 2, true);
        assert_eq!(a.digest, b.digest);

        let a = CacheKey::derive(&Method::GET, "/api/search", Some("b=2&a=1"), 2, false);
        let b = CacheKey::derive(&Method::GET, "/api/search", Some("a=1&b=2"), 2, false);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn digest_does_not_leak_query() {
        let key = CacheKey::derive(&Method::GET, "/api/search", Some("token=secret"), 2, true);
        assert!(!key.storage_key().contains("secret"));
    }

    #[test]
    fn scope_takes_leading_segments() {
        assert_eq!(invalidation_scope("/api/vehicles/7/photos", 2), "/api/vehicles");
        assert_eq!(invalidation_scope("/api", 2), "/api");
        assert_eq!(invalidation_scope("//api//vehicles/", 2), "/api/vehicles");
        assert_eq!(invalidation_scope("/", 2), "/");
        assert_eq!(invalidation_scope("/a/b/c", 1), "/a");
    }

    #[test]
    fn scope_covers_on_segment_boundaries() {
        assert!(scope_covers("/api/vehicles", "/api/vehicles"));
        assert!(scope_covers("/api", "/api/vehicles"));
        assert!(scope_covers("/", "/anything"));
        assert!(!scope_covers("/api/vehicles", "/api"));
        assert!(!scope_covers("/api/veh", "/api/vehicles"));
    }

    #[test]
    fn repeated_parameters_keep_their_order() {
        let a = CacheKey::derive(&Method::GET, "/api/search", Some("sort=year&sort=price"), 2, true);
        let b = CacheKey::derive(&Method::GET, "/api/search", Some("sort=price&sort=year"), 2, true);
        assert_ne!(a.digest, b.digest);

        assert_eq!(normalize_query("sort=year&q=x&sort=price"), "q=x&sort=year&sort=price");
        assert_eq!(normalize_query("b&a=1"), "a=1&b");
    }

    #[test]
    fn storage_key_round_trips_scope() {
        let key = CacheKey::derive(&Method::GET, "/api/vehicles/3", Some("x=1"), 2, true);
        assert_eq!(scope_of(&key.storage_key()), Some("/api/vehicles"));
    }
}
