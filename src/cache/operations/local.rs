use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::RwLock;

use super::CacheTier;
use crate::cache::keys::{CacheKey, scope_covers};
use crate::cache::models::{CacheEntry, CacheSource};
use crate::error::GuardResult;

/// 单次淘汰的比例（按过期时间最早优先）
const EVICTION_FRACTION: usize = 10;

#[derive(Debug, Clone)]
pub struct LocalCacheRecord {
    pub entry: Arc<CacheEntry>,
    pub scope: String,
    pub expires_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

/// 进程内缓存层
///
/// 读取时惰性检查过期；定期清扫删除过期条目，超出容量时按过期时间淘汰约 10%。
/// 条目本身不可变，所以只需要一把保护结构的读写锁。
pub struct LocalCacheStore {
    records: RwLock<HashMap<String, LocalCacheRecord>>,
    capacity: usize,
}

impl LocalCacheStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Arc<CacheEntry>> {
        let storage_key = key.storage_key();
        {
            let records = self.records.read();
            match records.get(&storage_key) {
                None => return None,
                Some(record) if record.expires_at > now => return Some(Arc::clone(&record.entry)),
                Some(_) => {}
            }
        }

        // 已过期：升级为写锁后再确认一次，期间可能已被重新写入
        let mut records = self.records.write();
        if records.get(&storage_key).is_some_and(|r| r.expires_at <= now) {
            records.remove(&storage_key);
            tracing::debug!(scope = %key.scope, "local cache entry expired on read");
        }
        records
            .get(&storage_key)
            .filter(|r| r.expires_at > now)
            .map(|r| Arc::clone(&r.entry))
    }

    pub fn insert_at(&self, key: &CacheKey, entry: Arc<CacheEntry>, now: Instant) {
        let record = LocalCacheRecord {
            expires_at: now + entry.ttl(),
            scope: key.scope.clone(),
            entry,
        };

        let mut records = self.records.write();
        records.insert(key.storage_key(), record);
        if records.len() > self.capacity {
            let evicted = evict_oldest(&mut records, self.capacity);
            tracing::debug!(evicted, capacity = self.capacity, "local cache over capacity");
        }
    }

    pub fn remove_scope(&self, scope: &str) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !scope_covers(scope, &record.scope));
        before - records.len()
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| record.expires_at > now);
        let expired = before - records.len();

        let evicted = if records.len() > self.capacity {
            evict_oldest(&mut records, self.capacity)
        } else {
            0
        };

        let report = SweepReport { expired, evicted };
        tracing::debug!(
            expired,
            evicted,
            remaining = records.len(),
            "local cache sweep complete"
        );
        report
    }
}

/// 按过期时间从早到晚分批删除，每批约 10%，直到不超过容量
fn evict_oldest(records: &mut HashMap<String, LocalCacheRecord>, capacity: usize) -> usize {
    let mut by_expiry: Vec<(Instant, String)> = records
        .iter()
        .map(|(key, record)| (record.expires_at, key.clone()))
        .collect();
    by_expiry.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let batch = (records.len() / EVICTION_FRACTION).max(1);
    let mut evicted = 0;
    for chunk in by_expiry.chunks(batch) {
        if records.len() <= capacity {
            break;
        }
        for (_, key) in chunk {
            records.remove(key);
            evicted += 1;
        }
    }
    evicted
}

impl CacheTier for LocalCacheStore {
    fn source(&self) -> CacheSource {
        CacheSource::Local
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, GuardResult<Option<Arc<CacheEntry>>>> {
        async move { Ok(self.get_at(key, Instant::now())) }.boxed()
    }

    fn put<'a>(&'a self, key: &'a CacheKey, entry: Arc<CacheEntry>) -> BoxFuture<'a, GuardResult<()>> {
        async move {
            self.insert_at(key, entry, Instant::now());
            Ok(())
        }
        .boxed()
    }

    fn invalidate<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, GuardResult<usize>> {
        async move { Ok(self.remove_scope(scope)) }.boxed()
    }
}
