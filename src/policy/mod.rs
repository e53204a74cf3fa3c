//! 路径策略注册表
//!
//! 启动时把配置中的路径模式编译为 `Exact` / `PrefixWildcard` 两类，
//! 请求路径上只做一次哈希查找加一次有序前缀扫描。

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::error::{GuardError, GuardResult};

/// 默认规则的桶键
pub const DEFAULT_POLICY_KEY: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathPattern {
    Exact(String),
    PrefixWildcard(String),
}

impl PathPattern {
    /// `"/a/b"` 为精确匹配，`"/a/b*"` 为前缀匹配
    pub fn parse(raw: &str) -> GuardResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GuardError::invalid_pattern(raw, "pattern is empty"));
        }
        if !raw.starts_with('/') {
            return Err(GuardError::invalid_pattern(raw, "pattern must start with '/'"));
        }

        match raw.find('*') {
            None => Ok(PathPattern::Exact(raw.to_string())),
            Some(idx) if idx == raw.len() - 1 => {
                Ok(PathPattern::PrefixWildcard(raw[..idx].to_string()))
            }
            Some(_) => Err(GuardError::invalid_pattern(
                raw,
                "'*' is only allowed as the final character",
            )),
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::Exact(p) => p == path,
            PathPattern::PrefixWildcard(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPattern::Exact(p) => f.write_str(p),
            PathPattern::PrefixWildcard(prefix) => write!(f, "{}*", prefix),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    /// `None` 表示默认规则
    pub pattern: Option<PathPattern>,
    pub requests_per_minute: u32,
    pub burst_capacity: u32,
    pub ttl: Duration,
    key: String,
}

impl PolicyRule {
    pub fn new(pattern: PathPattern, requests_per_minute: u32, burst_capacity: u32, ttl: Duration) -> Self {
        Self {
            key: pattern.to_string(),
            pattern: Some(pattern),
            requests_per_minute,
            burst_capacity,
            ttl,
        }
    }

    pub fn default_rule(requests_per_minute: u32, burst_capacity: u32, ttl: Duration) -> Self {
        Self {
            key: DEFAULT_POLICY_KEY.to_string(),
            pattern: None,
            requests_per_minute,
            burst_capacity,
            ttl,
        }
    }

    /// 令牌桶键中的策略部分，同一规则下的所有路径共享一个桶
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 每秒补充的令牌数
    pub fn refill_rate(&self) -> f64 {
        self.requests_per_minute as f64 / 60.0
    }

    pub fn capacity(&self) -> f64 {
        self.burst_capacity as f64
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    exact: HashMap<String, PolicyRule>,
    /// 按前缀长度降序排列
    prefixes: Vec<(String, PolicyRule)>,
    default: PolicyRule,
}

impl PolicyRegistry {
    pub fn new(default: PolicyRule, rules: Vec<PolicyRule>) -> GuardResult<Self> {
        let mut exact = HashMap::new();
        let mut prefixes: Vec<(String, PolicyRule)> = Vec::new();

        for rule in rules {
            if rule.requests_per_minute == 0 || rule.burst_capacity == 0 {
                return Err(GuardError::invalid_pattern(
                    rule.key(),
                    "requests_per_minute and burst must be greater than zero",
                ));
            }
            match rule.pattern.clone() {
                Some(PathPattern::Exact(path)) => {
                    if exact.insert(path.clone(), rule).is_some() {
                        return Err(GuardError::invalid_pattern(&path, "duplicate pattern"));
                    }
                }
                Some(PathPattern::PrefixWildcard(prefix)) => {
                    if prefixes.iter().any(|(p, _)| *p == prefix) {
                        return Err(GuardError::invalid_pattern(rule.key(), "duplicate pattern"));
                    }
                    prefixes.push((prefix, rule));
                }
                None => {
                    return Err(GuardError::config("override rule without a pattern"));
                }
            }
        }

        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(Self {
            exact,
            prefixes,
            default,
        })
    }

    pub fn from_config(config: &Config) -> GuardResult<Self> {
        let default_ttl = config.cache_default_ttl();
        let default = PolicyRule::default_rule(
            config.rate_limit_requests_per_minute,
            config.rate_limit_burst,
            default_ttl,
        );

        let rules = config
            .policy_overrides
            .iter()
            .map(|(raw, o)| {
                let pattern = PathPattern::parse(raw)?;
                let ttl = o.ttl_secs.map(Duration::from_secs).unwrap_or(default_ttl);
                Ok(PolicyRule::new(pattern, o.requests_per_minute, o.burst, ttl))
            })
            .collect::<GuardResult<Vec<_>>>()?;

        let registry = Self::new(default, rules)?;
        tracing::info!(
            exact = registry.exact.len(),
            prefix = registry.prefixes.len(),
            "policy registry compiled"
        );
        Ok(registry)
    }

    /// 精确匹配优先，其次最长前缀，最后默认规则
    pub fn resolve(&self, path: &str) -> &PolicyRule {
        if let Some(rule) = self.exact.get(path) {
            return rule;
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, rule)| rule)
            .unwrap_or(&self.default)
    }

    pub fn default_rule(&self) -> &PolicyRule {
        &self.default
    }
}
