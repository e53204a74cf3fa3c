//! 基于令牌桶的准入控制
//!
//! 每个 `(客户端, 策略)` 对应一个独立的令牌桶。桶表使用读写锁保护结构变更，
//! 单个桶的令牌数由自身的互斥锁保护，不同键之间只在查表的瞬间竞争。

mod bucket;
mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::config::Config;
use crate::error::GuardResult;
use crate::policy::{PolicyRegistry, PolicyRule};

pub use bucket::{Decision, TokenBucket};
pub use client::{ClientIdentity, ExemptList, X_FORWARDED_FOR, X_REAL_IP, client_identity};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub client: ClientIdentity,
    pub policy: String,
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    exempt: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AdmissionStats {
    pub allowed: u64,
    pub denied: u64,
    pub exempt: u64,
    pub tracked_buckets: usize,
}

pub struct AdmissionController {
    policies: Arc<PolicyRegistry>,
    exempt: ExemptList,
    idle_grace: Duration,
    buckets: RwLock<HashMap<BucketKey, Arc<Mutex<TokenBucket>>>>,
    counters: Counters,
}

impl AdmissionController {
    pub fn new(policies: Arc<PolicyRegistry>, exempt: ExemptList, idle_grace: Duration) -> Self {
        Self {
            policies,
            exempt,
            idle_grace,
            buckets: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &Config, policies: Arc<PolicyRegistry>) -> GuardResult<Self> {
        let exempt = ExemptList::parse(&config.rate_limit_exempt)?;
        tracing::info!(
            rpm = config.rate_limit_requests_per_minute,
            burst = config.rate_limit_burst,
            exempt = exempt.len(),
            "creating admission controller"
        );
        Ok(Self::new(policies, exempt, config.idle_grace()))
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn admit(&self, identity: &ClientIdentity, path: &str) -> Decision {
        self.admit_at(identity, path, Instant::now())
    }

    pub fn admit_at(&self, identity: &ClientIdentity, path: &str, now: Instant) -> Decision {
        let rule = self.policies.resolve(path);

        if self.exempt.contains(identity) {
            self.counters.exempt.fetch_add(1, Ordering::Relaxed);
            return Decision::exempt(rule.requests_per_minute, rule.capacity());
        }

        let bucket = self.bucket_for(identity, rule, now);
        let decision = bucket.lock().try_consume(now, rule.requests_per_minute);

        if decision.allowed {
            self.counters.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        decision
    }

    fn bucket_for(&self, identity: &ClientIdentity, rule: &PolicyRule, now: Instant) -> Arc<Mutex<TokenBucket>> {
        let key = BucketKey {
            client: identity.clone(),
            policy: rule.key().to_string(),
        };

        if let Some(bucket) = self.buckets.read().get(&key) {
            return Arc::clone(bucket);
        }

        // 写锁下再查一次，避免并发首请求重复建桶
        let mut buckets = self.buckets.write();
        Arc::clone(
            buckets
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::full(rule.capacity(), rule.refill_rate(), now)))),
        )
    }

    /// 移除已回满且空闲超过宽限期的桶，返回移除数量
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let grace = self.idle_grace;
        let mut buckets = self.buckets.write();
        let before = buckets.len();

        // 仍被请求持有的桶跳过
        buckets.retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.lock().is_idle(now, grace));

        let removed = before - buckets.len();
        tracing::debug!(removed, remaining = buckets.len(), "token bucket cleanup complete");
        removed
    }

    pub fn tracked_buckets(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            allowed: self.counters.allowed.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            exempt: self.counters.exempt.load(Ordering::Relaxed),
            tracked_buckets: self.tracked_buckets(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PathPattern;
    use std::thread;

    fn controller(rpm: u32, burst: u32, exempt: &[&str]) -> AdmissionController {
        let default = PolicyRule::default_rule(rpm, burst, Duration::from_secs(300));
        let search = PolicyRule::new(
            PathPattern::parse("/api/search*").unwrap(),
            30,
            5,
            Duration::from_secs(60),
        );
        let policies = PolicyRegistry::new(default, vec![search]).unwrap();
        AdmissionController::new(
            Arc::new(policies),
            ExemptList::parse(exempt).unwrap(),
            Duration::from_secs(60),
        )
    }

    fn ip(s: &str) -> ClientIdentity {
        ClientIdentity::Addr(s.parse().unwrap())
    }

    #[test]
    fn burst_then_deny_then_refill() {
        // capacity=2, 6 次/分钟 = 0.1 令牌/秒
        let limiter = controller(6, 2, &[]);
        let client = ip("10.0.0.1");
        let start = Instant::now();

        assert!(limiter.admit_at(&client, "/api/stats", start).allowed);
        assert!(limiter.admit_at(&client, "/api/stats", start).allowed);

        let denied = limiter.admit_at(&client, "/api/stats", start);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs(), 10);

        let later = start + Duration::from_secs(10);
        assert!(limiter.admit_at(&client, "/api/stats", later).allowed);
        assert!(!limiter.admit_at(&client, "/api/stats", later).allowed);
    }

    #[test]
    fn exempt_clients_are_never_denied() {
        let limiter = controller(1, 1, &["127.0.0.1"]);
        let client = ip("127.0.0.1");
        let now = Instant::now();

        for _ in 0..20 {
            assert!(limiter.admit_at(&client, "/api/stats", now).allowed);
        }
        assert_eq!(limiter.tracked_buckets(), 0);
        assert_eq!(limiter.stats().exempt, 20);
    }

    #[test]
    fn clients_and_policies_get_separate_buckets() {
        let limiter = controller(60, 1, &[]);
        let now = Instant::now();

        assert!(limiter.admit_at(&ip("10.0.0.1"), "/api/other", now).allowed);
        assert!(!limiter.admit_at(&ip("10.0.0.1"), "/api/other", now).allowed);
        // 默认规则下的路径共享一个桶
        assert!(!limiter.admit_at(&ip("10.0.0.1"), "/api/another", now).allowed);

        assert!(limiter.admit_at(&ip("10.0.0.2"), "/api/other", now).allowed);
        assert!(limiter.admit_at(&ip("10.0.0.1"), "/api/search", now).allowed);
        assert_eq!(limiter.tracked_buckets(), 3);
    }

    #[test]
    fn search_override_governs_limit_header() {
        let limiter = controller(60, 10, &[]);
        let now = Instant::now();
        let search = limiter.admit_at(&ip("10.0.0.1"), "/api/search", now);
        assert_eq!(search.limit, 30);
        assert_eq!(search.remaining_whole(), 4);

        let other = limiter.admit_at(&ip("10.0.0.1"), "/api/other", now);
        assert_eq!(other.limit, 60);
        assert_eq!(other.remaining_whole(), 9);
    }

    #[test]
    fn cleanup_removes_only_idle_full_buckets() {
        let limiter = controller(60, 5, &[]);
        let start = Instant::now();

        limiter.admit_at(&ip("10.0.0.1"), "/a", start);
        limiter.admit_at(&ip("10.0.0.2"), "/a", start + Duration::from_secs(100));

        let removed = limiter.cleanup_at(start + Duration::from_secs(120));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_buckets(), 1);
    }

    #[test]
    fn concurrent_admissions_never_exceed_capacity() {
        let limiter = Arc::new(controller(1, 25, &[]));
        let client = ip("10.9.9.9");
        let start = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let client = client.clone();
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| limiter.admit(&client, "/api/stats").allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let elapsed = start.elapsed().as_secs_f64();
        let ceiling = 25 + (elapsed * (1.0 / 60.0)).floor() as usize;
        assert!(admitted <= ceiling, "admitted {admitted} > {ceiling}");
        assert!(admitted >= 25);
        assert_eq!(limiter.stats().allowed as usize, admitted);
    }
}
