//! 周期性后台任务
//!
//! 每个任务持有同一个 `CancellationToken`，关闭时统一取消并等待退出。

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// 每隔 `every` 执行一次 `tick`，首次执行在一个周期之后
    pub fn spawn_periodic<F>(&mut self, name: &'static str, every: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(task = name, interval_secs = every.as_secs_f64(), "background task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(task = name, "background task shutting down");
                        break;
                    }
                    _ = ticker.tick() => tick(),
                }
            }
        });
        self.handles.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// 取消所有任务并等待它们退出
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                warn!(task = name, "background task ended abnormally: {}", e);
            }
        }
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}
