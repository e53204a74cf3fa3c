use std::time::Duration;

use thiserror::Error;

/// 网关内部错误
///
/// 只有 `Config` 与 `InvalidPattern` 会在启动阶段向外传播；
/// 远程缓存与序列化错误只记录日志，请求按未命中继续处理。
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid path pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("remote cache error: {0}")]
    Remote(#[from] redis::RedisError),

    #[error("remote cache timed out after {0:?}")]
    RemoteTimeout(Duration),

    #[error("remote cache unavailable, waiting before reconnecting")]
    RemoteUnavailable,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuardError {
    pub fn config(msg: impl Into<String>) -> Self {
        GuardError::Config(msg.into())
    }

    pub fn invalid_pattern(pattern: &str, reason: &str) -> Self {
        GuardError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
