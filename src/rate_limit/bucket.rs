use std::time::{Duration, Instant};

use crate::utils::{ceil_secs, unix_now};

/// 单次准入判定结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: f64,
    pub reset_in: Duration,
    /// 策略的每分钟请求数，用于 `X-RateLimit-Limit`
    pub limit: u32,
}

impl Decision {
    /// 白名单客户端的放行结果，不消耗令牌
    pub fn exempt(limit: u32, capacity: f64) -> Self {
        Self {
            allowed: true,
            remaining: capacity,
            reset_in: Duration::ZERO,
            limit,
        }
    }

    /// `Retry-After` 秒数，拒绝时至少为 1
    pub fn retry_after_secs(&self) -> u64 {
        let secs = ceil_secs(self.reset_in);
        if self.allowed { secs } else { secs.max(1) }
    }

    pub fn remaining_whole(&self) -> u64 {
        self.remaining.max(0.0).floor() as u64
    }

    /// 令牌桶回满的 Unix 时间戳
    pub fn reset_epoch(&self) -> i64 {
        unix_now() + ceil_secs(self.reset_in) as i64
    }
}

/// 连续补充的令牌桶
///
/// 令牌数只在消费时按流逝时间惰性重算，不依赖定时器。
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn full(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        // 时钟不回退
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// 补充后尝试消费一个令牌
    pub fn try_consume(&mut self, now: Instant, limit: u32) -> Decision {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Decision {
                allowed: true,
                remaining: self.tokens,
                reset_in: self.secs_until(self.capacity - self.tokens),
                limit,
            }
        } else {
            Decision {
                allowed: false,
                remaining: self.tokens,
                reset_in: self.secs_until(1.0 - self.tokens),
                limit,
            }
        }
    }

    /// 不修改状态地估算 `now` 时刻的令牌数
    pub fn projected_tokens(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    /// 已回满且空闲超过宽限期
    pub fn is_idle(&self, now: Instant, grace: Duration) -> bool {
        self.projected_tokens(now) >= self.capacity
            && now.saturating_duration_since(self.last_refill) > grace
    }

    fn secs_until(&self, deficit: f64) -> Duration {
        if deficit <= 0.0 || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(deficit / self.refill_rate)
    }
}
