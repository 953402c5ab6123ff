//! Small helpers bridging kernel address representations and [`IpNetwork`].

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    pub fn of_network(net: &IpNetwork) -> Self {
        Self::of(&net.ip())
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// Network covering only `addr`.
pub fn host_network(addr: IpAddr) -> IpNetwork {
    IpNetwork::from(addr)
}

/// Builds a network from an address and prefix length, clearing host bits so
/// that equal networks compare equal no matter how the kernel reported them.
pub fn network(addr: IpAddr, prefix: u8) -> Result<IpNetwork> {
    let net = IpNetwork::new(addr, prefix)?;
    Ok(IpNetwork::new(net.network(), prefix)?)
}

/// Same as [`network`] for a value that is already an [`IpNetwork`].
pub fn canonical(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

/// Keeps the networks of `family`.
pub fn filter_family(nets: &[IpNetwork], family: Family) -> Vec<IpNetwork> {
    nets.iter()
        .copied()
        .filter(|n| Family::of_network(n) == family)
        .collect()
}

/// First address of `family` in `addrs`.
pub fn first_of_family(addrs: &[IpAddr], family: Family) -> Option<IpAddr> {
    addrs.iter().copied().find(|a| Family::of(a) == family)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_family() {
        assert_eq!(Family::of(&"10.0.0.1".parse().unwrap()), Family::V4);
        assert_eq!(Family::of(&"fd00::1".parse().unwrap()), Family::V6);
    }

    #[test]
    fn test_host_network() {
        let net = host_network("10.96.0.5".parse().unwrap());
        assert_eq!(net, IpNetwork::from_str("10.96.0.5/32").unwrap());
        let net = host_network("fd00::5".parse().unwrap());
        assert_eq!(net.prefix(), 128);
    }

    #[test]
    fn test_network_clears_host_bits() -> Result<()> {
        let net = network("10.1.2.3".parse()?, 8)?;
        assert_eq!(net, IpNetwork::from_str("10.0.0.0/8")?);
        assert_eq!(
            canonical(IpNetwork::from_str("172.16.5.4/12")?),
            IpNetwork::from_str("172.16.0.0/12")?
        );
        Ok(())
    }

    #[test]
    fn test_filter_family() -> Result<()> {
        let nets = vec![
            IpNetwork::from_str("10.0.0.0/8")?,
            IpNetwork::from_str("2001:db8::/32")?,
            IpNetwork::from_str("192.168.0.0/16")?,
        ];
        assert_eq!(filter_family(&nets, Family::V4).len(), 2);
        assert_eq!(
            filter_family(&nets, Family::V6),
            vec![IpNetwork::from_str("2001:db8::/32")?]
        );
        Ok(())
    }
}
