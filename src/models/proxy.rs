use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CarouselError, Result};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Protocol {
    Http = 1,
    Https = 2,
    Socks4 = 3,
    Socks5 = 4,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Socks4 => "socks4",
            Protocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            "socks4" => Some(Protocol::Socks4),
            "socks5" => Some(Protocol::Socks5),
            _ => None,
        }
    }

    fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            1 => Some(Protocol::Http),
            2 => Some(Protocol::Https),
            3 => Some(Protocol::Socks4),
            4 => Some(Protocol::Socks5),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Opaque proxy identifier packing an IPv4 address, a port and a protocol tag
/// into a single 64-bit value.
///
/// Layout: bits 63..32 hold the address, bits 31..16 the port, bits 15..0 the
/// protocol tag. The zero value means "no proxy"; a valid identifier requires
/// a non-zero port. Equality and hashing go through the packed value, which
/// makes identifiers cheap map keys and gives deterministic shard bucketing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct ProxyId(u64);

impl ProxyId {
    /// The "no proxy" value.
    pub const NONE: ProxyId = ProxyId(0);

    pub fn new(ip: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        let packed = (u64::from(u32::from(ip)) << 32)
            | (u64::from(port) << 16)
            | u64::from(protocol as u16);
        ProxyId(packed)
    }

    /// Parse an identifier from a `scheme://ip:port` string.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s)?;
        let protocol = Protocol::from_str(url.scheme())
            .ok_or_else(|| CarouselError::UnsupportedProtocol(url.scheme().to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| CarouselError::InvalidProxyAddress(s.to_string()))?;
        let ip: Ipv4Addr = host
            .parse()
            .map_err(|_| CarouselError::InvalidProxyAddress(s.to_string()))?;
        let port = url
            .port()
            .ok_or_else(|| CarouselError::InvalidProxyAddress(s.to_string()))?;
        Ok(ProxyId::new(ip, port, protocol))
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from((self.0 >> 32) as u32)
    }

    pub fn port(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_tag(self.0 as u16)
    }

    /// A valid identifier carries a non-zero port.
    pub fn is_valid(&self) -> bool {
        self.port() != 0
    }

    /// Deterministic shard bucket for this identifier.
    pub fn bucket(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count > 0);
        (self.0 % shard_count as u64) as usize
    }

    /// `ip:port` form, used when dialing the proxy.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip(), self.port())
    }

    /// `scheme://ip:port` form.
    pub fn url(&self) -> String {
        let scheme = self.protocol().map(|p| p.as_str()).unwrap_or("http");
        format!("{}://{}:{}", scheme, self.ip(), self.port())
    }

    pub fn packed(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let id = ProxyId::new(Ipv4Addr::new(1, 2, 3, 4), 8080, Protocol::Socks5);
        assert_eq!(id.ip(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(id.port(), 8080);
        assert_eq!(id.protocol(), Some(Protocol::Socks5));
        assert!(id.is_valid());
    }

    #[test]
    fn test_zero_value_is_invalid() {
        assert!(!ProxyId::NONE.is_valid());
        assert_eq!(ProxyId::default(), ProxyId::NONE);

        // A zero port makes an identifier invalid even with an address set.
        let id = ProxyId::new(Ipv4Addr::new(10, 0, 0, 1), 0, Protocol::Http);
        assert!(!id.is_valid());
    }

    #[test]
    fn test_bucket_is_pure_and_deterministic() {
        let id = ProxyId::new(Ipv4Addr::new(198, 51, 100, 7), 3128, Protocol::Http);
        let first = id.bucket(32);
        for _ in 0..10 {
            assert_eq!(id.bucket(32), first);
        }
        assert!(first < 32);

        let same = ProxyId::new(Ipv4Addr::new(198, 51, 100, 7), 3128, Protocol::Http);
        assert_eq!(same.bucket(32), first);
    }

    #[test]
    fn test_parse_url_forms() {
        let id = ProxyId::parse("http://1.2.3.4:8080").unwrap();
        assert_eq!(id.ip(), Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(id.port(), 8080);
        assert_eq!(id.protocol(), Some(Protocol::Http));
        assert_eq!(id.addr(), "1.2.3.4:8080");
        assert_eq!(id.url(), "http://1.2.3.4:8080");

        let id = ProxyId::parse("socks5://127.0.0.1:1080").unwrap();
        assert_eq!(id.protocol(), Some(Protocol::Socks5));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            ProxyId::parse("ftp://1.2.3.4:21"),
            Err(CarouselError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            ProxyId::parse("http://not-an-ip:8080"),
            Err(CarouselError::InvalidProxyAddress(_))
        ));
        assert!(ProxyId::parse("not a url").is_err());
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!(Protocol::from_str("HTTP"), Some(Protocol::Http));
        assert_eq!(Protocol::from_str("socks4"), Some(Protocol::Socks4));
        assert_eq!(Protocol::from_str("unknown"), None);
        assert_eq!(Protocol::Socks5.to_string(), "socks5");
    }
}
