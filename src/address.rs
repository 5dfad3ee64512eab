/// Address resolution helpers
///
/// `external()` finds the address other hosts reach this node on, and
/// `fingerprint()` derives a stable identifier from it. The fingerprint stays
/// the same across restarts as long as the host's address does not change.
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Well-known public address used only to pick the outbound interface;
/// connecting a UDP socket sends no packet.
const ROUTE_PROBE: &str = "8.8.8.8:80";

static EXTERNAL: Lazy<IpAddr> = Lazy::new(resolve_external);

/// The external address of this host, resolved once
pub fn external() -> IpAddr {
    *EXTERNAL
}

/// Stable fingerprint of this host (16 hex characters)
pub fn fingerprint() -> String {
    fingerprint_of(&external())
}

/// Fingerprint of an arbitrary address
pub fn fingerprint_of(addr: &IpAddr) -> String {
    let digest = Sha256::digest(addr.to_string().as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

fn resolve_external() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(ROUTE_PROBE)?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let a = fingerprint();
        let b = fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_differs_per_address() {
        let one = fingerprint_of(&"10.0.0.1".parse().unwrap());
        let two = fingerprint_of(&"10.0.0.2".parse().unwrap());
        assert_ne!(one, two);
    }
}
