//! Per-peer Foo-over-UDP tunnels.
//!
//! Every peer address gets one point-to-point tunnel interface whose name is
//! derived from the address, so the kernel itself is the record of which
//! tunnels exist.

pub mod fou;
#[cfg(test)]
pub mod memory;

use std::net::IpAddr;

use sha2::{Digest, Sha256};

use crate::Result;
use crate::kernel::Link;

pub use fou::FouTunnel;

const V4_PREFIX: &str = "fou4_";
const V6_PREFIX: &str = "fou6_";

#[tonic::async_trait]
pub trait TunnelController: Send + Sync {
    /// Prepares the namespace for FoU tunnels. Idempotent.
    async fn init(&self) -> Result<()>;

    async fn is_initialized(&self) -> Result<bool>;

    /// Returns the tunnel to `addr`, creating it when missing.
    ///
    /// Fails with [`crate::Error::IpFamilyMismatch`] when no local address of
    /// the same family is configured.
    async fn add_peer(&self, addr: IpAddr) -> Result<Link>;

    /// Removes the tunnel to `addr`; a missing tunnel is not an error.
    async fn del_peer(&self, addr: IpAddr) -> Result<()>;
}

/// Interface name of the tunnel to `addr`.
///
/// IPv6 addresses do not fit in IFNAMSIZ, so the name carries the first four
/// bytes of their SHA-256 digest instead.
pub fn link_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(addr) => format!("{V4_PREFIX}{}", hex(&addr.octets())),
        IpAddr::V6(addr) => {
            let mut hasher = Sha256::new();
            hasher.update(addr.octets());
            let digest = hasher.finalize();
            format!("{V6_PREFIX}{}", hex(&digest[..4]))
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_link_name_v4() {
        assert_eq!(link_name("10.96.0.5".parse().unwrap()), "fou4_0a600005");
        assert_eq!(link_name("192.168.1.1".parse().unwrap()), "fou4_c0a80101");
    }

    #[test]
    fn test_link_name_v6() {
        let a = link_name("fd00::5".parse().unwrap());
        let b = link_name("fd00::6".parse().unwrap());
        assert!(a.starts_with(V6_PREFIX));
        assert_eq!(a.len(), V6_PREFIX.len() + 8);
        assert!(a.len() < 16);
        assert_ne!(a, b);
        assert_eq!(a, link_name("fd00::5".parse().unwrap()));
    }
}
