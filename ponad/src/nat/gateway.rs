use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, info};

use crate::kernel::iptables::Iptables;
use crate::kernel::{Kernel, Link, RouteSpec};
use crate::nat::{GATEWAY_RULE_PRIORITY, GATEWAY_TABLE, NatGateway, ROUTE_PROTOCOL};
use crate::netiputil::{self, Family};
use crate::{Error, Result};

pub const SENTINEL: &str = "nat-dummy";

/// Masquerades client traffic leaving through `iface` and routes the
/// replies back to the client tunnels.
pub struct NatGatewayController {
    iface: String,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
    kernel: Arc<Kernel>,
}

impl NatGatewayController {
    pub fn new(
        kernel: Arc<Kernel>,
        iface: impl Into<String>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
    ) -> Self {
        Self {
            iface: iface.into(),
            ipv4,
            ipv6,
            kernel,
        }
    }

    fn own_addrs(&self) -> Vec<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
            .collect()
    }

    fn has_family(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.ipv4.is_some(),
            Family::V6 => self.ipv6.is_some(),
        }
    }
}

fn masquerade_rule(own: IpAddr, iface: &str) -> Vec<String> {
    let own = netiputil::host_network(own).to_string();
    ["!", "-s", &own, "-o", iface, "-j", "MASQUERADE"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[tonic::async_trait]
impl NatGateway for NatGatewayController {
    async fn init(&self) -> Result<()> {
        if self.is_initialized().await? {
            return Ok(());
        }
        for own in self.own_addrs() {
            let family = Family::of(&own);
            Iptables::new(family)
                .append_unique(
                    &self.kernel.ns,
                    "nat",
                    "POSTROUTING",
                    &masquerade_rule(own, &self.iface),
                )
                .await?;
            self.kernel
                .netlink
                .add_rule(
                    family,
                    GATEWAY_RULE_PRIORITY,
                    GATEWAY_TABLE,
                    Some(&self.iface),
                )
                .await?;
        }
        self.kernel.netlink.add_dummy(SENTINEL).await?;
        info!(iface = %self.iface, "nat gateway initialized");
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.kernel.netlink.link_by_name(SENTINEL).await?.is_some())
    }

    async fn add_client(&self, addr: IpAddr, link: &Link) -> Result<()> {
        let family = Family::of(&addr);
        if !self.has_family(family) {
            return Err(Error::IpFamilyMismatch(addr));
        }
        let dst = netiputil::host_network(addr);
        let routes = self.kernel.netlink.routes(family, GATEWAY_TABLE).await?;
        if routes.iter().any(|r| r.dst == dst) {
            debug!(client = %addr, "route to client already present");
            return Ok(());
        }

        self.kernel.netlink.set_link_up(link).await?;
        self.kernel
            .netlink
            .add_route(&RouteSpec {
                dst,
                oif: Some(link.index),
                table: GATEWAY_TABLE,
                protocol: ROUTE_PROTOCOL,
                priority: None,
                throw: false,
            })
            .await?;
        info!(client = %addr, link = %link.name, "added route to nat client");
        Ok(())
    }
}
