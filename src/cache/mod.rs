// 响应缓存模块
// 包含缓存键、缓存条目、各缓存层实现，以及串联它们的 ResponseCache

pub mod keys;
pub mod models;
pub mod operations;
pub mod recorder;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::{
    extract::Request,
    http::{HeaderMap, Method, Uri, header},
    response::Response,
};
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::Config;
use crate::error::{GuardError, GuardResult};
use crate::policy::PolicyRegistry;

pub use keys::{CacheKey, invalidation_scope, scope_covers};
pub use models::{CacheEntry, CacheSource, X_CACHE_AGE, X_CACHE_HIT, X_CACHE_SOURCE};
pub use operations::{CacheTier, LocalCacheStore, RemoteCacheStore, SweepReport};
pub use recorder::ResponseRecorder;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub invalidation_depth: usize,
    pub normalize_query: bool,
    pub max_body_bytes: usize,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            invalidation_depth: config.cache_invalidation_depth,
            normalize_query: config.cache_normalize_query,
            max_body_bytes: config.cache_max_body_bytes,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    stale_skips: AtomicU64,
    remote_errors: AtomicU64,
}

/// 失效记录保留时长，超过这个时长仍未返回的读请求不再受保护
const INVALIDATION_MEMORY: Duration = Duration::from_secs(600);

/// 各失效范围最近一次失效的序号
///
/// 读请求在调用下游前取一次全局序号，写入缓存前检查是否有覆盖自己范围的
/// 更新的失效发生；有则放弃写入，避免把失效前读到的旧响应重新缓存。
#[derive(Debug, Default)]
struct InvalidationLog {
    sequence: AtomicU64,
    scopes: RwLock<HashMap<String, (u64, Instant)>>,
}

impl InvalidationLog {
    fn current(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    fn record(&self, scope: &str, now: Instant) {
        let mut scopes = self.scopes.write();
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        scopes.insert(scope.to_string(), (seq, now));
    }

    fn invalidated_since(&self, started: u64, scope: &str) -> bool {
        if self.current() == started {
            return false;
        }
        self.scopes
            .read()
            .iter()
            .any(|(invalidated, (seq, _))| *seq > started && scope_covers(invalidated, scope))
    }

    fn prune(&self, now: Instant) -> usize {
        let mut scopes = self.scopes.write();
        let before = scopes.len();
        scopes.retain(|_, (_, at)| now.saturating_duration_since(*at) < INVALIDATION_MEMORY);
        before - scopes.len()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub remote_hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub invalidations: u64,
    pub stale_skips: u64,
    pub remote_errors: u64,
    pub local_entries: usize,
    pub remote_enabled: bool,
}

/// 只读方法参与缓存
pub fn is_cacheable(method: &Method) -> bool {
    *method == Method::GET || *method == Method::HEAD
}

/// 除只读方法与 OPTIONS / TRACE / CONNECT 之外的方法都触发失效，包括自定义方法
pub fn is_mutating(method: &Method) -> bool {
    !is_cacheable(method)
        && !matches!(*method, Method::OPTIONS | Method::TRACE | Method::CONNECT)
}

/// 请求明确要求绕过缓存读取
fn wants_fresh(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase())
        .any(|d| d == "no-cache" || d == "no-store")
}

/// 两级响应缓存
///
/// 按顺序查找各缓存层（远程在前、本地在后），首个命中即返回；
/// 写入时依次写入所有层。远程层的任何错误都按未命中处理，本地层始终可用。
pub struct ResponseCache {
    tiers: Vec<Arc<dyn CacheTier>>,
    local: Arc<LocalCacheStore>,
    policies: Arc<PolicyRegistry>,
    settings: CacheSettings,
    counters: Counters,
    invalidation_log: InvalidationLog,
}

impl ResponseCache {
    pub fn new(
        policies: Arc<PolicyRegistry>,
        local: Arc<LocalCacheStore>,
        remote: Option<Arc<RemoteCacheStore>>,
        settings: CacheSettings,
    ) -> Self {
        let mut tiers: Vec<Arc<dyn CacheTier>> = Vec::with_capacity(2);
        if let Some(remote) = remote {
            tiers.push(remote);
        }
        tiers.push(local.clone());

        Self {
            tiers,
            local,
            policies,
            settings,
            counters: Counters::default(),
            invalidation_log: InvalidationLog::default(),
        }
    }

    pub fn from_config(config: &Config, policies: Arc<PolicyRegistry>) -> GuardResult<Self> {
        let local = Arc::new(LocalCacheStore::new(config.cache_capacity));
        let remote = match config.redis_url.as_deref() {
            Some(url) => Some(Arc::new(RemoteCacheStore::new(
                url,
                config.redis_key_prefix.clone(),
                config.redis_timeout(),
            )?)),
            None => None,
        };

        tracing::info!(
            capacity = config.cache_capacity,
            remote = remote.is_some(),
            default_ttl_secs = config.cache_default_ttl_secs,
            "creating response cache"
        );
        Ok(Self::new(policies, local, remote, CacheSettings::from_config(config)))
    }

    pub fn local(&self) -> &LocalCacheStore {
        &self.local
    }

    pub fn remote_enabled(&self) -> bool {
        self.tiers.iter().any(|t| t.source() == CacheSource::Remote)
    }

    pub fn key_for(&self, method: &Method, uri: &Uri) -> CacheKey {
        CacheKey::derive(
            method,
            uri.path(),
            uri.query(),
            self.settings.invalidation_depth,
            self.settings.normalize_query,
        )
    }

    /// 按层查找，首个命中即返回；出错的层按未命中处理
    pub async fn lookup(&self, key: &CacheKey) -> Option<(Arc<CacheEntry>, CacheSource)> {
        for tier in &self.tiers {
            let source = tier.source();
            let result = match tier.timeout() {
                Some(limit) => match tokio::time::timeout(limit, tier.get(key)).await {
                    Ok(result) => result,
                    Err(_) => Err(GuardError::RemoteTimeout(limit)),
                },
                None => tier.get(key).await,
            };

            match result {
                Ok(Some(entry)) => {
                    let counter = match source {
                        CacheSource::Local => &self.counters.local_hits,
                        CacheSource::Remote => &self.counters.remote_hits,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(tier = %source, scope = %key.scope, "cache hit");
                    return Some((entry, source));
                }
                Ok(None) => {}
                Err(e) => self.tier_failed(source, "lookup", &e),
            }
        }
        None
    }

    /// 写入所有缓存层
    pub async fn store(&self, key: &CacheKey, entry: CacheEntry) {
        let entry = Arc::new(entry);
        for tier in &self.tiers {
            let source = tier.source();
            let result = match tier.timeout() {
                Some(limit) => {
                    match tokio::time::timeout(limit, tier.put(key, Arc::clone(&entry))).await {
                        Ok(result) => result,
                        Err(_) => Err(GuardError::RemoteTimeout(limit)),
                    }
                }
                None => tier.put(key, Arc::clone(&entry)).await,
            };
            if let Err(e) = result {
                self.tier_failed(source, "store", &e);
            }
        }
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// 按写请求路径推导失效范围并清除各层中该范围下的条目
    ///
    /// 返回同步清除的数量；后台执行的层不计入。
    pub async fn invalidate(&self, path: &str) -> usize {
        let scope = invalidation_scope(path, self.settings.invalidation_depth);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.invalidation_log.record(&scope, Instant::now());
        let mut removed = 0;

        for tier in &self.tiers {
            if tier.detached_invalidation() {
                let tier = Arc::clone(tier);
                let scope = scope.clone();
                tokio::spawn(async move {
                    if let Err(e) = tier.invalidate(&scope).await {
                        tracing::warn!(tier = %tier.source(), scope = %scope, "cache invalidation failed: {}", e);
                    }
                });
                continue;
            }

            match tier.invalidate(&scope).await {
                Ok(n) => removed += n,
                Err(e) => self.tier_failed(tier.source(), "invalidate", &e),
            }
        }

        tracing::debug!(scope = %scope, removed, "cache scope invalidated");
        removed
    }

    /// 包装下游处理函数
    pub async fn handle<F, Fut>(&self, req: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let method = req.method().clone();

        if is_mutating(&method) {
            let path = req.uri().path().to_string();
            let response = next(req).await;
            self.invalidate(&path).await;
            return response;
        }

        if !is_cacheable(&method) {
            return next(req).await;
        }

        let key = self.key_for(&method, req.uri());
        if !wants_fresh(req.headers()) {
            if let Some((entry, source)) = self.lookup(&key).await {
                return entry.to_response(source);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let ttl = self.policies.resolve(req.uri().path()).ttl;
        let started = self.invalidation_log.current();

        let mut recorder = ResponseRecorder::new();
        let mut response = recorder.capture(next(req).await).await;

        if let Some(entry) = recorder.to_entry(ttl, self.settings.max_body_bytes) {
            if self.invalidation_log.invalidated_since(started, &key.scope) {
                self.counters.stale_skips.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = %key.scope, "scope invalidated while handler ran, not caching");
            } else {
                self.store(&key, entry).await;
            }
        }

        models::mark_miss(&mut response);
        response
    }

    /// 定期清扫本地层，同时丢弃过旧的失效记录
    pub fn sweep(&self) -> SweepReport {
        self.invalidation_log.prune(Instant::now());
        self.local.sweep()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.counters.local_hits.load(Ordering::Relaxed),
            remote_hits: self.counters.remote_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            stale_skips: self.counters.stale_skips.load(Ordering::Relaxed),
            remote_errors: self.counters.remote_errors.load(Ordering::Relaxed),
            local_entries: self.local.len(),
            remote_enabled: self.remote_enabled(),
        }
    }

    fn tier_failed(&self, source: CacheSource, op: &str, err: &GuardError) {
        if source == CacheSource::Remote {
            self.counters.remote_errors.fetch_add(1, Ordering::Relaxed);
        }
        match err {
            GuardError::RemoteUnavailable => {
                tracing::debug!(tier = %source, op, "cache tier skipped: {}", err)
            }
            _ => tracing::warn!(tier = %source, op, "cache tier failed, treating as miss: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PathPattern, PolicyRule};
    use axum::body::{Body, to_bytes};
    use axum::http::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cache_with(remote: Option<Arc<RemoteCacheStore>>) -> ResponseCache {
        let default = PolicyRule::default_rule(60, 10, Duration::from_secs(300));
        let short = PolicyRule::new(
            PathPattern::parse("/api/flash*").unwrap(),
            60,
            10,
            Duration::from_millis(200),
        );
        let policies = Arc::new(PolicyRegistry::new(default, vec![short]).unwrap());
        ResponseCache::new(
            policies,
            Arc::new(LocalCacheStore::new(100)),
            remote,
            CacheSettings::default(),
        )
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn call(cache: &ResponseCache, req: Request, calls: &AtomicUsize, status: StatusCode) -> Response {
        cache
            .handle(req, |_req| async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                let mut resp = Response::new(Body::from(format!("{{\"call\":{}}}", n)));
                *resp.status_mut() = status;
                resp
            })
            .await
    }

    async fn body(resp: Response) -> Vec<u8> {
        to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn second_get_is_a_local_hit() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);

        let first = call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(first.headers()[X_CACHE_HIT], "false");
        let first_body = body(first).await;

        let second = call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(second.headers()[X_CACHE_HIT], "true");
        assert_eq!(second.headers()[X_CACHE_SOURCE], "local");
        assert_eq!(body(second).await, first_body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_responses_are_not_cached() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);

        call(&cache, request(Method::GET, "/api/broken"), &calls, StatusCode::INTERNAL_SERVER_ERROR).await;
        let again = call(&cache, request(Method::GET, "/api/broken"), &calls, StatusCode::INTERNAL_SERVER_ERROR).await;
        assert_eq!(again.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.local().len(), 0);
    }

    #[tokio::test]
    async fn entries_expire_after_policy_ttl() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);

        call(&cache, request(Method::GET, "/api/flash"), &calls, StatusCode::OK).await;
        call(&cache, request(Method::GET, "/api/flash"), &calls, StatusCode::OK).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after = call(&cache, request(Method::GET, "/api/flash"), &calls, StatusCode::OK).await;
        assert_eq!(after.headers()[X_CACHE_HIT], "false");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mutation_invalidates_scope() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);

        call(&cache, request(Method::GET, "/api/vehicles"), &calls, StatusCode::OK).await;
        call(&cache, request(Method::GET, "/api/vehicles/3"), &calls, StatusCode::OK).await;
        call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(cache.local().len(), 3);

        let post = call(&cache, request(Method::POST, "/api/vehicles"), &calls, StatusCode::CREATED).await;
        assert_eq!(post.status(), StatusCode::CREATED);
        assert!(post.headers().get(X_CACHE_HIT).is_none());
        assert_eq!(cache.local().len(), 1);

        let list = call(&cache, request(Method::GET, "/api/vehicles"), &calls, StatusCode::OK).await;
        assert_eq!(list.headers()[X_CACHE_HIT], "false");
        let stats = call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(stats.headers()[X_CACHE_HIT], "true");
    }

    #[tokio::test]
    async fn no_cache_request_skips_lookup() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);

        call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        let fresh = Request::builder()
            .uri("/api/stats")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::empty())
            .unwrap();
        let resp = call(&cache, fresh, &calls, StatusCode::OK).await;
        assert_eq!(resp.headers()[X_CACHE_HIT], "false");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unreachable_remote_degrades_to_local() {
        let remote = RemoteCacheStore::new("redis://127.0.0.1:1/", "test:", Duration::from_millis(100)).unwrap();
        let cache = cache_with(Some(Arc::new(remote)));
        assert!(cache.remote_enabled());
        let calls = AtomicUsize::new(0);

        let first = call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = call(&cache, request(Method::GET, "/api/stats"), &calls, StatusCode::OK).await;
        assert_eq!(second.headers()[X_CACHE_SOURCE], "local");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        call(&cache, request(Method::DELETE, "/api/stats"), &calls, StatusCode::NO_CONTENT).await;
        assert_eq!(cache.local().len(), 0);
        assert!(cache.stats().remote_errors >= 1);
    }

    fn text(body: &'static str) -> Response {
        Response::new(Body::from(body))
    }

    #[tokio::test]
    async fn read_racing_a_write_is_not_cached() {
        let cache = cache_with(None);
        let gate = tokio::sync::Notify::new();
        let gate = &gate;

        let slow_get = cache.handle(request(Method::GET, "/api/vehicles"), |_req| async move {
            gate.notified().await;
            text("old")
        });
        let write_then_release = async {
            let resp = cache
                .handle(request(Method::POST, "/api/vehicles"), |_req| async move { text("created") })
                .await;
            gate.notify_one();
            resp
        };

        let (stale, created) = tokio::join!(slow_get, write_then_release);
        assert_eq!(body(stale).await, b"old");
        assert_eq!(body(created).await, b"created");
        assert_eq!(cache.local().len(), 0);
        assert_eq!(cache.stats().stale_skips, 1);

        let fresh = cache
            .handle(request(Method::GET, "/api/vehicles"), |_req| async move { text("new") })
            .await;
        assert_eq!(fresh.headers()[X_CACHE_HIT], "false");
        assert_eq!(body(fresh).await, b"new");

        let cached = cache
            .handle(request(Method::GET, "/api/vehicles"), |_req| async move { text("unused") })
            .await;
        assert_eq!(cached.headers()[X_CACHE_HIT], "true");
        assert_eq!(body(cached).await, b"new");
    }

    #[tokio::test]
    async fn write_to_another_scope_does_not_block_caching() {
        let cache = cache_with(None);
        let gate = tokio::sync::Notify::new();
        let gate = &gate;

        let slow_get = cache.handle(request(Method::GET, "/api/stats"), |_req| async move {
            gate.notified().await;
            text("stats")
        });
        let write_then_release = async {
            cache
                .handle(request(Method::PUT, "/api/vehicles/1"), |_req| async move { text("ok") })
                .await;
            gate.notify_one();
        };
        tokio::join!(slow_get, write_then_release);

        assert_eq!(cache.local().len(), 1);
        assert_eq!(cache.stats().stale_skips, 0);
    }

    #[tokio::test]
    async fn custom_methods_invalidate() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);
        call(&cache, request(Method::GET, "/api/vehicles"), &calls, StatusCode::OK).await;
        assert_eq!(cache.local().len(), 1);

        let purge = Method::from_bytes(b"PURGE").unwrap();
        assert!(is_mutating(&purge));
        assert!(!is_mutating(&Method::OPTIONS));
        assert!(!is_mutating(&Method::TRACE));

        call(&cache, request(purge, "/api/vehicles"), &calls, StatusCode::OK).await;
        assert_eq!(cache.local().len(), 0);
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn invalidation_log_covers_nested_scopes_and_prunes() {
        let log = InvalidationLog::default();
        let now = Instant::now();
        let started = log.current();
        assert!(!log.invalidated_since(started, "/api/vehicles"));

        log.record("/api", now);
        assert!(log.invalidated_since(started, "/api/vehicles"));
        assert!(!log.invalidated_since(started, "/health"));
        assert!(!log.invalidated_since(log.current(), "/api/vehicles"));

        assert_eq!(log.prune(now + Duration::from_secs(1)), 0);
        assert_eq!(log.prune(now + INVALIDATION_MEMORY), 1);
    }

    #[tokio::test]
    async fn options_pass_through_untouched() {
        let cache = cache_with(None);
        let calls = AtomicUsize::new(0);
        let resp = call(&cache, request(Method::OPTIONS, "/api/stats"), &calls, StatusCode::OK).await;
        assert!(resp.headers().get(X_CACHE_HIT).is_none());
        assert_eq!(cache.stats().invalidations, 0);
        assert_eq!(cache.local().len(), 0);
    }
}
