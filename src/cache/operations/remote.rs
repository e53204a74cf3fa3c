use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use redis::{AsyncCommands, Client as RedisClient, aio::ConnectionManager};
use tokio::sync::OnceCell;

use super::CacheTier;
use crate::cache::keys::{CacheKey, scope_covers, scope_of};
use crate::cache::models::{CacheEntry, CacheSource};
use crate::error::{GuardError, GuardResult};
use crate::utils::ceil_secs;

/// 连接失败后暂停访问远程层的时长
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
/// 单次 SCAN 返回的建议数量
const SCAN_BATCH: usize = 200;
/// 单次失效最多执行的 SCAN 轮数
const MAX_SCAN_ROUNDS: usize = 10_000;

/// Redis 缓存层
///
/// 尽力而为：任何错误（超时、连接失败、反序列化失败）都交给调用方当作未命中处理。
pub struct RemoteCacheStore {
    client: RedisClient,
    connection: OnceCell<ConnectionManager>,
    unavailable_until: Mutex<Option<Instant>>,
    prefix: String,
    timeout: Duration,
}

impl RemoteCacheStore {
    pub fn new(url: &str, prefix: impl Into<String>, timeout: Duration) -> GuardResult<Self> {
        let client = RedisClient::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            unavailable_until: Mutex::new(None),
            prefix: prefix.into(),
            timeout,
        })
    }

    pub fn redis_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.prefix, key.storage_key())
    }

    /// 匹配 `scope` 及其下所有路径的 SCAN 模式，精确过滤在取回后进行
    fn scan_pattern(&self, scope: &str) -> String {
        let mut pattern = String::with_capacity(self.prefix.len() + scope.len() + 1);
        for c in self.prefix.chars().chain(scope.chars()) {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }

    async fn bounded<T, F>(&self, fut: F) -> GuardResult<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GuardError::RemoteTimeout(self.timeout)),
        }
    }

    async fn connection(&self) -> GuardResult<ConnectionManager> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }

        let cooling_down = self
            .unavailable_until
            .lock()
            .is_some_and(|until| Instant::now() < until);
        if cooling_down {
            return Err(GuardError::RemoteUnavailable);
        }

        let result = tokio::time::timeout(
            self.timeout,
            self.connection
                .get_or_try_init(|| self.client.get_connection_manager()),
        )
        .await;

        match result {
            Ok(Ok(conn)) => {
                *self.unavailable_until.lock() = None;
                tracing::info!("remote cache connected");
                Ok(conn.clone())
            }
            Ok(Err(e)) => {
                self.mark_unavailable();
                Err(e.into())
            }
            Err(_) => {
                self.mark_unavailable();
                Err(GuardError::RemoteTimeout(self.timeout))
            }
        }
    }

    fn mark_unavailable(&self) {
        *self.unavailable_until.lock() = Some(Instant::now() + RECONNECT_COOLDOWN);
    }

    pub async fn fetch(&self, key: &CacheKey) -> GuardResult<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);
        let raw: Option<Vec<u8>> = self.bounded(conn.get(&redis_key)).await?;
        match raw {
            Some(bytes) => decode_live(&bytes),
            None => Ok(None),
        }
    }

    pub async fn store(&self, key: &CacheKey, entry: &CacheEntry) -> GuardResult<()> {
        let ttl_secs = ceil_secs(entry.remaining_ttl());
        if ttl_secs == 0 {
            return Ok(());
        }
        let payload = serde_json::to_vec(entry)?;
        let mut conn = self.connection().await?;
        let redis_key = self.redis_key(key);
        self.bounded(conn.set_ex::<_, _, ()>(&redis_key, payload, ttl_secs))
            .await
    }

    /// 增量 SCAN + DEL，每一步都有超时
    pub async fn purge_scope(&self, scope: &str) -> GuardResult<usize> {
        let mut conn = self.connection().await?;
        let pattern = self.scan_pattern(scope);
        let mut cursor: u64 = 0;
        let mut removed = 0;

        for _ in 0..MAX_SCAN_ROUNDS {
            let (next, keys): (u64, Vec<String>) = self
                .bounded(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn),
                )
                .await?;

            let doomed: Vec<String> = keys
                .into_iter()
                .filter(|k| {
                    k.strip_prefix(self.prefix.as_str())
                        .and_then(scope_of)
                        .is_some_and(|s| scope_covers(scope, s))
                })
                .collect();

            if !doomed.is_empty() {
                let deleted: usize = self.bounded(conn.del(&doomed)).await?;
                removed += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!(scope, removed, "remote cache scope purged");
        Ok(removed)
    }
}

/// `SET EX` 按整秒取整，读取时再按条目自身的 TTL 过滤一次
fn decode_live(bytes: &[u8]) -> GuardResult<Option<CacheEntry>> {
    let entry: CacheEntry = serde_json::from_slice(bytes)?;
    if entry.remaining_ttl().is_zero() {
        return Ok(None);
    }
    Ok(Some(entry))
}

impl CacheTier for RemoteCacheStore {
    fn source(&self) -> CacheSource {
        CacheSource::Remote
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, GuardResult<Option<Arc<CacheEntry>>>> {
        async move { Ok(self.fetch(key).await?.map(Arc::new)) }.boxed()
    }

    fn put<'a>(&'a self, key: &'a CacheKey, entry: Arc<CacheEntry>) -> BoxFuture<'a, GuardResult<()>> {
        async move { self.store(key, &entry).await }.boxed()
    }

    fn invalidate<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, GuardResult<usize>> {
        async move { self.purge_scope(scope).await }.boxed()
    }

    fn detached_invalidation(&self) -> bool {
        true
    }
}
