use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{GuardError, GuardResult};

/// 单条路径策略覆盖，来自 `POLICY_OVERRIDES`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyOverride {
    pub requests_per_minute: u32,
    pub burst: u32,
    /// 未设置时沿用默认缓存时长
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub rate_limit_requests_per_minute: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_exempt: Vec<String>,
    pub rate_limit_cleanup_interval_secs: u64,
    pub rate_limit_idle_grace_secs: u64,
    pub policy_overrides: BTreeMap<String, PolicyOverride>,
    pub redis_url: Option<String>,
    pub redis_timeout_ms: u64,
    pub redis_key_prefix: String,
    pub cache_capacity: usize,
    pub cache_default_ttl_secs: u64,
    pub cache_sweep_interval_secs: u64,
    pub cache_max_body_bytes: usize,
    pub cache_invalidation_depth: usize,
    pub cache_normalize_query: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server_host: "0.0.0.0".into(),
            server_port: 3000,
            rate_limit_requests_per_minute: 60,
            rate_limit_burst: 10,
            rate_limit_exempt: Vec::new(),
            rate_limit_cleanup_interval_secs: 60,
            rate_limit_idle_grace_secs: 300,
            policy_overrides: BTreeMap::new(),
            redis_url: None,
            redis_timeout_ms: 100,
            redis_key_prefix: "resp_cache:".into(),
            cache_capacity: 10_000,
            cache_default_ttl_secs: 300,
            cache_sweep_interval_secs: 60,
            cache_max_body_bytes: 1024 * 1024,
            cache_invalidation_depth: 2,
            cache_normalize_query: true,
        }
    }
}

impl Config {
    pub fn from_env() -> GuardResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// 从任意键值来源读取配置，缺省项使用默认值，格式错误立即失败
    pub fn from_lookup<F>(lookup: F) -> GuardResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let policy_overrides = match var("POLICY_OVERRIDES") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                GuardError::config(format!("POLICY_OVERRIDES is not valid JSON: {}", e))
            })?,
            None => defaults.policy_overrides,
        };

        let rate_limit_exempt = var("RATE_LIMIT_EXEMPT")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let config = Config {
            server_host: var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse_or(&var, "SERVER_PORT", defaults.server_port)?,
            rate_limit_requests_per_minute: parse_or(
                &var,
                "RATE_LIMIT_REQUESTS_PER_MINUTE",
                defaults.rate_limit_requests_per_minute,
            )?,
            rate_limit_burst: parse_or(&var, "RATE_LIMIT_BURST", defaults.rate_limit_burst)?,
            rate_limit_exempt,
            rate_limit_cleanup_interval_secs: parse_or(
                &var,
                "RATE_LIMIT_CLEANUP_INTERVAL_SECS",
                defaults.rate_limit_cleanup_interval_secs,
            )?,
            rate_limit_idle_grace_secs: parse_or(
                &var,
                "RATE_LIMIT_IDLE_GRACE_SECS",
                defaults.rate_limit_idle_grace_secs,
            )?,
            policy_overrides,
            redis_url: var("REDIS_URL"),
            redis_timeout_ms: parse_or(&var, "REDIS_TIMEOUT_MS", defaults.redis_timeout_ms)?,
            redis_key_prefix: var("REDIS_KEY_PREFIX").unwrap_or(defaults.redis_key_prefix),
            cache_capacity: parse_or(&var, "CACHE_CAPACITY", defaults.cache_capacity)?,
            cache_default_ttl_secs: parse_or(
                &var,
                "CACHE_DEFAULT_TTL_SECS",
                defaults.cache_default_ttl_secs,
            )?,
            cache_sweep_interval_secs: parse_or(
                &var,
                "CACHE_SWEEP_INTERVAL_SECS",
                defaults.cache_sweep_interval_secs,
            )?,
            cache_max_body_bytes: parse_or(
                &var,
                "CACHE_MAX_BODY_BYTES",
                defaults.cache_max_body_bytes,
            )?,
            cache_invalidation_depth: parse_or(
                &var,
                "CACHE_INVALIDATION_DEPTH",
                defaults.cache_invalidation_depth,
            )?,
            cache_normalize_query: parse_or(
                &var,
                "CACHE_NORMALIZE_QUERY",
                defaults.cache_normalize_query,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GuardResult<()> {
        let non_zero = [
            ("RATE_LIMIT_REQUESTS_PER_MINUTE", self.rate_limit_requests_per_minute as u64),
            ("RATE_LIMIT_BURST", self.rate_limit_burst as u64),
            ("RATE_LIMIT_CLEANUP_INTERVAL_SECS", self.rate_limit_cleanup_interval_secs),
            ("REDIS_TIMEOUT_MS", self.redis_timeout_ms),
            ("CACHE_CAPACITY", self.cache_capacity as u64),
            ("CACHE_SWEEP_INTERVAL_SECS", self.cache_sweep_interval_secs),
            ("CACHE_INVALIDATION_DEPTH", self.cache_invalidation_depth as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, v)| *v == 0) {
            return Err(GuardError::config(format!("{} must be greater than zero", name)));
        }

        for (pattern, rule) in &self.policy_overrides {
            if rule.requests_per_minute == 0 || rule.burst == 0 {
                return Err(GuardError::invalid_pattern(
                    pattern,
                    "requests_per_minute and burst must be greater than zero",
                ));
            }
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cleanup_interval_secs)
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.rate_limit_idle_grace_secs)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }

    pub fn cache_default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}

fn parse_or<T, F>(var: &F, name: &str, default: T) -> GuardResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GuardError::config(format!("{} has invalid value `{}`: {}", name, raw, e))),
        None => Ok(default),
    }
}
