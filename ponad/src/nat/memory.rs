use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use ipnetwork::IpNetwork;

use crate::kernel::Link;
use crate::nat::client::diff_routes;
use crate::nat::{NatClient, NatGateway};
use crate::netiputil::Family;
use crate::{Error, Result};

/// In-memory [`NatGateway`] recording the client routes it was asked for.
pub struct MemoryGateway {
    v4: bool,
    v6: bool,
    initialized: Mutex<bool>,
    clients: Mutex<BTreeMap<IpAddr, Link>>,
}

impl MemoryGateway {
    pub fn new(v4: bool, v6: bool) -> Self {
        Self {
            v4,
            v6,
            initialized: Mutex::new(false),
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn clients(&self) -> Vec<IpAddr> {
        self.clients.lock().unwrap().keys().copied().collect()
    }
}

#[tonic::async_trait]
impl NatGateway for MemoryGateway {
    async fn init(&self) -> Result<()> {
        *self.initialized.lock().unwrap() = true;
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(*self.initialized.lock().unwrap())
    }

    async fn add_client(&self, addr: IpAddr, link: &Link) -> Result<()> {
        let supported = match Family::of(&addr) {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        };
        if !supported {
            return Err(Error::IpFamilyMismatch(addr));
        }
        self.clients
            .lock()
            .unwrap()
            .entry(addr)
            .or_insert_with(|| link.clone());
        Ok(())
    }
}

/// In-memory [`NatClient`] keeping one route set per link index.
#[derive(Default)]
pub struct MemoryClient {
    initialized: Mutex<bool>,
    routes: Mutex<BTreeMap<u32, Vec<IpNetwork>>>,
}

impl MemoryClient {
    pub fn routes(&self, link: &Link) -> Vec<IpNetwork> {
        self.routes
            .lock()
            .unwrap()
            .get(&link.index)
            .cloned()
            .unwrap_or_default()
    }
}

#[tonic::async_trait]
impl NatClient for MemoryClient {
    async fn init(&self) -> Result<()> {
        *self.initialized.lock().unwrap() = true;
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(*self.initialized.lock().unwrap())
    }

    async fn update_routes(&self, link: &Link, subnets: &[IpNetwork]) -> Result<()> {
        let mut routes = self.routes.lock().unwrap();
        let entry = routes.entry(link.index).or_default();
        let (adds, dels) = diff_routes(entry, subnets);
        entry.retain(|net| !dels.contains(net));
        entry.extend(adds);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[tokio::test]
    async fn test_update_routes_converges() -> Result<()> {
        let client = MemoryClient::default();
        let link = Link {
            index: 7,
            name: "fou4_0a600005".into(),
        };
        let nets = |list: &[&str]| -> Vec<IpNetwork> {
            list.iter().map(|n| IpNetwork::from_str(n).unwrap()).collect()
        };
        client
            .update_routes(&link, &nets(&["10.0.0.0/8", "172.16.0.0/12"]))
            .await?;
        client
            .update_routes(&link, &nets(&["172.16.0.0/12", "192.168.0.0/16"]))
            .await?;
        assert_eq!(
            client.routes(&link),
            nets(&["172.16.0.0/12", "192.168.0.0/16"])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_gateway_family_mismatch() {
        let gateway = MemoryGateway::new(true, false);
        let link = Link {
            index: 1,
            name: "x".into(),
        };
        let err = gateway
            .add_client("fd00::1".parse().unwrap(), &link)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IpFamilyMismatch(_)));
    }
}
