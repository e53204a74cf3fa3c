use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};

/// 计算输入的 SHA-256 摘要，返回小写十六进制字符串
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// 当前 Unix 时间戳（秒）
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// 当前 Unix 时间戳（毫秒）
pub fn unix_now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 向上取整到秒
pub fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}
