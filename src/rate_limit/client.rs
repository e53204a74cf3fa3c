use std::fmt;
use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;
use ipnet::IpNet;

use crate::error::{GuardError, GuardResult};

pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// 限流使用的客户端身份
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    Addr(IpAddr),
    /// 所有来源都无法解析时的兜底身份，这类请求共享一个桶
    Unknown,
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Addr(ip) => write!(f, "{}", ip),
            ClientIdentity::Unknown => f.write_str("unknown"),
        }
    }
}

/// 按优先级提取客户端身份：
/// `X-Forwarded-For` 第一项 → `X-Real-IP` → 连接对端地址
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> ClientIdentity {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim);
    if let Some(raw) = forwarded {
        match raw.parse::<IpAddr>() {
            Ok(ip) => return ClientIdentity::Addr(ip),
            Err(_) => tracing::debug!(value = raw, "unparsable x-forwarded-for entry, falling through"),
        }
    }

    let real_ip = headers
        .get(X_REAL_IP)
        .and_then(|h| h.to_str().ok())
        .map(str::trim);
    if let Some(raw) = real_ip {
        match raw.parse::<IpAddr>() {
            Ok(ip) => return ClientIdentity::Addr(ip),
            Err(_) => tracing::debug!(value = raw, "unparsable x-real-ip header, falling through"),
        }
    }

    peer.map(|addr| ClientIdentity::Addr(addr.ip()))
        .unwrap_or(ClientIdentity::Unknown)
}

/// 免限流名单，支持单个 IP 与 CIDR 网段
#[derive(Debug, Clone, Default)]
pub struct ExemptList {
    networks: Vec<IpNet>,
}

impl ExemptList {
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> GuardResult<Self> {
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.as_ref().trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(network) = trimmed.parse::<IpNet>() {
                networks.push(network);
            } else if let Ok(addr) = trimmed.parse::<IpAddr>() {
                networks.push(IpNet::from(addr));
            } else {
                return Err(GuardError::config(format!(
                    "invalid exempt entry `{}`: expected an IP address or CIDR block",
                    trimmed
                )));
            }
        }
        Ok(Self { networks })
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        match identity {
            ClientIdentity::Addr(ip) => self.networks.iter().any(|net| net.contains(ip)),
            ClientIdentity::Unknown => false,
        }
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(v));
        }
        map
    }

    fn peer() -> Option<SocketAddr> {
        Some("192.168.1.20:51234".parse().unwrap())
    }

    fn addr(s: &str) -> ClientIdentity {
        ClientIdentity::Addr(s.parse().unwrap())
    }

    #[test]
    fn forwarded_for_first_entry_wins() {
        let h = headers(&[
            (X_FORWARDED_FOR, "203.0.113.7, 10.0.0.1"),
            (X_REAL_IP, "198.51.100.2"),
        ]);
        assert_eq!(client_identity(&h, peer()), addr("203.0.113.7"));
    }

    #[test]
    fn invalid_forwarded_for_falls_through_to_real_ip() {
        let h = headers(&[(X_FORWARDED_FOR, "garbage, 10.0.0.1"), (X_REAL_IP, "198.51.100.2")]);
        assert_eq!(client_identity(&h, peer()), addr("198.51.100.2"));
    }

    #[test]
    fn falls_back_to_peer_host_without_port() {
        let h = headers(&[(X_REAL_IP, "not-an-ip")]);
        assert_eq!(client_identity(&h, peer()), addr("192.168.1.20"));
        assert_eq!(client_identity(&HeaderMap::new(), None), ClientIdentity::Unknown);
    }

    #[test]
    fn ipv6_forwarded_for() {
        let h = headers(&[(X_FORWARDED_FOR, "2001:db8::1")]);
        assert_eq!(client_identity(&h, None), addr("2001:db8::1"));
    }

    #[test]
    fn exempt_list_matches_ips_and_cidrs() {
        let list = ExemptList::parse(&["127.0.0.1", "10.0.0.0/8", "::1"]).unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.contains(&addr("127.0.0.1")));
        assert!(list.contains(&addr("10.20.30.40")));
        assert!(list.contains(&addr("::1")));
        assert!(!list.contains(&addr("127.0.0.2")));
        assert!(!list.contains(&ClientIdentity::Unknown));
    }

    #[test]
    fn exempt_list_rejects_garbage() {
        assert!(ExemptList::parse(&["10.0.0.0/33"]).is_err());
        assert!(ExemptList::parse(&["localhost"]).is_err());
    }
}
