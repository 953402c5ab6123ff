use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, info};

use crate::Result;
use crate::kernel::{Kernel, Link, Route, RouteSpec};
use crate::nat::{CLIENT_RULE_PRIORITY, CLIENT_TABLE, NatClient, ROUTE_PROTOCOL};
use crate::netiputil::{self, Family};

const THROW_METRIC: u32 = 10;
const EGRESS_METRIC: u32 = 20;

const PRIVATE_NETWORKS: [&str; 4] = ["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "fc00::/7"];
const LINK_LOCAL_NETWORKS: [&str; 2] = ["169.254.0.0/16", "fe80::/10"];

/// Networks that never leave through an egress tunnel unless overridden.
pub fn default_private_networks() -> Vec<IpNetwork> {
    PRIVATE_NETWORKS
        .iter()
        .filter_map(|n| IpNetwork::from_str(n).ok())
        .collect()
}

/// Splits the route reconciliation into prefixes to add and prefixes to
/// delete. Prefixes in both sets are left alone.
pub fn diff_routes(
    current: &[IpNetwork],
    desired: &[IpNetwork],
) -> (Vec<IpNetwork>, Vec<IpNetwork>) {
    let current: Vec<IpNetwork> = current.iter().copied().map(netiputil::canonical).collect();
    let desired: Vec<IpNetwork> = desired.iter().copied().map(netiputil::canonical).collect();
    let have: HashSet<&IpNetwork> = current.iter().collect();
    let want: HashSet<&IpNetwork> = desired.iter().collect();

    let mut adds = Vec::new();
    for net in &desired {
        if !have.contains(net) && !adds.contains(net) {
            adds.push(*net);
        }
    }
    let dels = current
        .iter()
        .filter(|net| !want.contains(net))
        .copied()
        .collect();
    (adds, dels)
}

/// Compares the routes read back from the client table with the prefixes
/// wanted through the link at `index`. Returns the prefixes to add and the
/// route records to delete; throw routes and routes through other links are
/// never touched.
pub fn plan_routes<'a>(
    routes: &'a [Route],
    index: u32,
    desired: &[IpNetwork],
) -> (Vec<IpNetwork>, Vec<&'a Route>) {
    let current: Vec<&Route> = routes
        .iter()
        .filter(|r| r.oif == Some(index) && !r.throw)
        .collect();
    let current_nets: Vec<IpNetwork> = current.iter().map(|r| r.dst).collect();
    let (adds, dels) = diff_routes(&current_nets, desired);
    let dels = current
        .into_iter()
        .filter(|r| dels.contains(&netiputil::canonical(r.dst)))
        .collect();
    (adds, dels)
}

/// Prefixes thrown back to the next rule: `private` plus link-local ranges.
fn throw_networks(private: &[IpNetwork], family: Family) -> Vec<IpNetwork> {
    let link_local = LINK_LOCAL_NETWORKS
        .iter()
        .filter_map(|n| IpNetwork::from_str(n).ok());
    private
        .iter()
        .copied()
        .chain(link_local)
        .filter(|n| Family::of_network(n) == family)
        .collect()
}

/// Steers pod traffic for egress destinations into tunnels, using a
/// dedicated table consulted by a catch-all rule.
pub struct NatClientController {
    families: Vec<Family>,
    private: Vec<IpNetwork>,
    kernel: Arc<Kernel>,
}

impl NatClientController {
    /// `exclude` replaces the default private networks when non-empty.
    pub fn new(
        kernel: Arc<Kernel>,
        local4: Option<Ipv4Addr>,
        local6: Option<Ipv6Addr>,
        exclude: &[IpNetwork],
    ) -> Self {
        let mut families = Vec::with_capacity(2);
        if local4.is_some() {
            families.push(Family::V4);
        }
        if local6.is_some() {
            families.push(Family::V6);
        }
        let private = if exclude.is_empty() {
            default_private_networks()
        } else {
            exclude.to_vec()
        };
        Self {
            families,
            private,
            kernel,
        }
    }

    async fn clear(&self, family: Family) -> Result<()> {
        let netlink = &self.kernel.netlink;
        for rule in netlink.rules(family).await? {
            if rule.priority == Some(CLIENT_RULE_PRIORITY) {
                netlink.del_rule(&rule).await?;
            }
        }
        for route in netlink.routes(family, CLIENT_TABLE).await? {
            netlink.del_route(&route).await?;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl NatClient for NatClientController {
    async fn init(&self) -> Result<()> {
        for &family in &self.families {
            self.clear(family).await?;
            self.kernel
                .netlink
                .add_rule(family, CLIENT_RULE_PRIORITY, CLIENT_TABLE, None)
                .await?;
        }
        info!(ns = %self.kernel.ns, "nat client initialized");
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        for &family in &self.families {
            let rules = self.kernel.netlink.rules(family).await?;
            let count = rules.iter().filter(|r| r.table == CLIENT_TABLE).count();
            if count != 1 {
                debug!("{family} has {count} nat client rules");
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[tracing::instrument(skip_all, fields(link = %link.name))]
    async fn update_routes(&self, link: &Link, subnets: &[IpNetwork]) -> Result<()> {
        let netlink = &self.kernel.netlink;

        let mut routes = Vec::new();
        for &family in &self.families {
            routes.extend(netlink.routes(family, CLIENT_TABLE).await?);
        }
        let (adds, dels) = plan_routes(&routes, link.index, subnets);

        netlink.set_link_up(link).await?;

        for &family in &self.families {
            for dst in throw_networks(&self.private, family) {
                netlink
                    .add_route(&RouteSpec {
                        dst,
                        oif: None,
                        table: CLIENT_TABLE,
                        protocol: ROUTE_PROTOCOL,
                        priority: Some(THROW_METRIC),
                        throw: true,
                    })
                    .await?;
            }
        }

        for dst in &adds {
            netlink
                .add_route(&RouteSpec {
                    dst: *dst,
                    oif: Some(link.index),
                    table: CLIENT_TABLE,
                    protocol: ROUTE_PROTOCOL,
                    priority: Some(EGRESS_METRIC),
                    throw: false,
                })
                .await?;
            debug!(%dst, "added egress route");
        }

        for route in &dels {
            netlink.del_route(route).await?;
            debug!(dst = %route.dst, "deleted egress route");
        }

        info!(adds = adds.len(), dels = dels.len(), "egress routes updated");
        Ok(())
    }
}
