use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Mutex;

use crate::kernel::Link;
use crate::netiputil::Family;
use crate::tunnel::{TunnelController, link_name};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    initialized: bool,
    peers: BTreeMap<IpAddr, Link>,
    next_index: u32,
    fail_del: BTreeSet<IpAddr>,
    adds: usize,
    dels: usize,
}

/// In-memory [`TunnelController`] with the same contract as the kernel one.
pub struct MemoryTunnel {
    v4: bool,
    v6: bool,
    state: Mutex<State>,
}

impl MemoryTunnel {
    pub fn new(v4: bool, v6: bool) -> Self {
        Self {
            v4,
            v6,
            state: Mutex::new(State {
                next_index: 100,
                ..Default::default()
            }),
        }
    }

    pub fn peers(&self) -> Vec<IpAddr> {
        self.state.lock().unwrap().peers.keys().copied().collect()
    }

    pub fn has_peer(&self, addr: IpAddr) -> bool {
        self.state.lock().unwrap().peers.contains_key(&addr)
    }

    /// Makes the next `del_peer(addr)` fail without touching the tunnel.
    pub fn fail_del_once(&self, addr: IpAddr) {
        self.state.lock().unwrap().fail_del.insert(addr);
    }

    /// Number of tunnels actually created and deleted.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (state.adds, state.dels)
    }
}

#[tonic::async_trait]
impl TunnelController for MemoryTunnel {
    async fn init(&self) -> Result<()> {
        self.state.lock().unwrap().initialized = true;
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().initialized)
    }

    async fn add_peer(&self, addr: IpAddr) -> Result<Link> {
        let mut state = self.state.lock().unwrap();
        if let Some(link) = state.peers.get(&addr) {
            return Ok(link.clone());
        }
        let supported = match Family::of(&addr) {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        };
        if !supported {
            return Err(Error::IpFamilyMismatch(addr));
        }
        state.next_index += 1;
        let link = Link {
            index: state.next_index,
            name: link_name(addr),
        };
        state.peers.insert(addr, link.clone());
        state.adds += 1;
        Ok(link)
    }

    async fn del_peer(&self, addr: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_del.remove(&addr) {
            return Err(Error::Other(format!("deleting tunnel to {addr} failed")));
        }
        if state.peers.remove(&addr).is_some() {
            state.dels += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_add_peer_is_idempotent() -> Result<()> {
        let tunnel = MemoryTunnel::new(true, false);
        let addr: IpAddr = "10.96.0.5".parse()?;
        let first = tunnel.add_peer(addr).await?;
        let second = tunnel.add_peer(addr).await?;
        assert_eq!(first, second);
        assert_eq!(tunnel.counts(), (1, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_del_peer_is_idempotent() -> Result<()> {
        let tunnel = MemoryTunnel::new(true, true);
        let addr: IpAddr = "10.96.0.5".parse()?;
        tunnel.del_peer(addr).await?;
        tunnel.add_peer(addr).await?;
        tunnel.del_peer(addr).await?;
        tunnel.del_peer(addr).await?;
        assert!(!tunnel.has_peer(addr));
        assert_eq!(tunnel.counts(), (1, 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_family_mismatch() -> Result<()> {
        let tunnel = MemoryTunnel::new(true, false);
        let err = tunnel.add_peer("fd00::5".parse()?).await.unwrap_err();
        assert!(matches!(err, Error::IpFamilyMismatch(_)));
        assert!(tunnel.peers().is_empty());
        Ok(())
    }
}
