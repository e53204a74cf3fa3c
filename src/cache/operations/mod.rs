// 缓存层操作
// 每一层实现同一个 `CacheTier` 接口，由 `ResponseCache` 按顺序查找、并行写入

pub mod local;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::cache::keys::CacheKey;
use crate::cache::models::{CacheEntry, CacheSource};
use crate::error::GuardResult;

pub use local::{LocalCacheRecord, LocalCacheStore, SweepReport};
pub use remote::RemoteCacheStore;

pub trait CacheTier: Send + Sync {
    fn source(&self) -> CacheSource;

    /// 单次读写的超时，`None` 表示不需要超时（进程内）
    fn timeout(&self) -> Option<Duration>;

    fn get<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, GuardResult<Option<Arc<CacheEntry>>>>;

    fn put<'a>(&'a self, key: &'a CacheKey, entry: Arc<CacheEntry>) -> BoxFuture<'a, GuardResult<()>>;

    /// 删除 `scope` 覆盖的全部条目，返回删除数量
    fn invalidate<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, GuardResult<usize>>;

    /// 为 true 时失效在后台任务里执行，不阻塞写请求的响应
    fn detached_invalidation(&self) -> bool {
        false
    }
}
