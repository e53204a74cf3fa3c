use std::sync::Arc;
use std::time::Duration;

use axum::{Router, middleware::from_fn_with_state};
use serde::Serialize;
use tower::ServiceBuilder;

use crate::cache::{CacheStats, ResponseCache};
use crate::config::Config;
use crate::error::GuardResult;
use crate::middleware::{rate_limit, response_cache};
use crate::policy::PolicyRegistry;
use crate::rate_limit::{AdmissionController, AdmissionStats};
use crate::tasks::BackgroundTasks;

#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub admission: AdmissionStats,
    pub cache: CacheStats,
}

impl GuardStats {
    pub fn collect(admission: &AdmissionController, cache: &ResponseCache) -> Self {
        Self {
            admission: admission.stats(),
            cache: cache.stats(),
        }
    }
}

/// 准入控制与响应缓存的组合
///
/// 启动时构造，持有两个注册表和后台清理任务；`shutdown` 时停止任务。
pub struct Gatekeeper {
    admission: Arc<AdmissionController>,
    cache: Arc<ResponseCache>,
    cleanup_interval: Duration,
    sweep_interval: Duration,
    tasks: Option<BackgroundTasks>,
}

impl Gatekeeper {
    pub fn new(
        admission: Arc<AdmissionController>,
        cache: Arc<ResponseCache>,
        cleanup_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            admission,
            cache,
            cleanup_interval,
            sweep_interval,
            tasks: None,
        }
    }

    pub fn from_config(config: &Config) -> GuardResult<Self> {
        config.validate()?;
        let policies = Arc::new(PolicyRegistry::from_config(config)?);
        let admission = Arc::new(AdmissionController::from_config(config, Arc::clone(&policies))?);
        let cache = Arc::new(ResponseCache::from_config(config, policies)?);

        Ok(Self::new(
            admission,
            cache,
            config.cleanup_interval(),
            config.cache_sweep_interval(),
        ))
    }

    /// 启动令牌桶清理与本地缓存清扫任务，需在 Tokio 运行时内调用
    pub fn start(&mut self) {
        if self.tasks.is_some() {
            return;
        }
        let mut tasks = BackgroundTasks::new();

        let admission = Arc::clone(&self.admission);
        tasks.spawn_periodic("bucket-cleanup", self.cleanup_interval, move || {
            admission.cleanup();
        });

        let cache = Arc::clone(&self.cache);
        tasks.spawn_periodic("cache-sweep", self.sweep_interval, move || {
            cache.sweep();
        });

        self.tasks = Some(tasks);
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_some()
    }

    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    pub fn cache(&self) -> Arc<ResponseCache> {
        Arc::clone(&self.cache)
    }

    /// 安装中间件，执行顺序：准入控制 → 响应缓存 → 处理函数
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(Arc::clone(&self.admission), rate_limit))
                .layer(from_fn_with_state(Arc::clone(&self.cache), response_cache)),
        )
    }

    pub fn stats(&self) -> GuardStats {
        GuardStats::collect(&self.admission, &self.cache)
    }

    pub async fn shutdown(mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.shutdown().await;
        }
        tracing::info!("gatekeeper stopped");
    }
}
