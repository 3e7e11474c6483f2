use crate::error::{ProxyError, Result};

use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

/// Original destination of a redirected flow, published by the external
/// redirector keyed by the client's ephemeral source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestInfo {
    pub source_port: u16,
    pub family: IpFamily,
    pub ipv4: u32,
    pub ipv6: [u8; 16],
    pub port: u16,
    pub app_id: u64,
}

impl DestInfo {
    pub fn new_v4(source_port: u16, ipv4: u32, port: u16, app_id: u64) -> Self {
        Self {
            source_port,
            family: IpFamily::V4,
            ipv4,
            ipv6: [0; 16],
            port,
            app_id,
        }
    }

    pub fn new_v6(source_port: u16, ipv6: [u8; 16], port: u16, app_id: u64) -> Self {
        Self {
            source_port,
            family: IpFamily::V6,
            ipv4: 0,
            ipv6,
            port,
            app_id,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self.family {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::from(self.ipv4)),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::from(self.ipv6)),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip(), self.port)
    }
}

/// Short-lived source-port → destination mapping. Entries live from
/// redirection until the handler consumes them, one lookup per flow.
#[derive(Default)]
pub struct DestRegistry {
    entries: DashMap<u16, DestInfo>,
}

impl DestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, info: DestInfo) {
        self.entries.insert(info.source_port, info);
    }

    pub fn get(&self, source_port: u16) -> Result<DestInfo> {
        self.entries
            .get(&source_port)
            .map(|e| *e.value())
            .ok_or(ProxyError::DestNotFound(source_port))
    }

    pub fn delete(&self, source_port: u16) {
        self.entries.remove(&source_port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_releases_the_port() {
        let registry = DestRegistry::new();
        let info = DestInfo::new_v4(40001, u32::from(Ipv4Addr::new(10, 1, 2, 3)), 3306, 7);
        registry.publish(info);

        let got = registry.get(40001).unwrap();
        assert_eq!(got.socket_addr().to_string(), "10.1.2.3:3306");
        registry.delete(40001);
        assert!(matches!(
            registry.get(40001),
            Err(ProxyError::DestNotFound(40001))
        ));
    }

    #[test]
    fn v6_destination_addr() {
        let mut ip6 = [0u8; 16];
        ip6[15] = 1;
        let info = DestInfo::new_v6(40002, ip6, 443, 7);
        assert_eq!(info.socket_addr().to_string(), "[::1]:443");
    }
}
