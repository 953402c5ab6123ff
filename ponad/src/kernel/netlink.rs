use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use netlink_packet_route::AddressFamily;
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteType,
};
use netlink_packet_route::rule::{RuleAttribute, RuleMessage};
use rtnetlink::{IpVersion, RouteAddRequest, RuleAddRequest};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::kernel::{is_exists, is_not_found};
use crate::netiputil::{self, Family};
use crate::{Error, Result};

/// A network interface as seen by the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
}

/// A route read back from the kernel.
#[derive(Clone, Debug)]
pub struct Route {
    pub dst: IpNetwork,
    pub oif: Option<u32>,
    pub table: u32,
    pub protocol: u8,
    pub priority: Option<u32>,
    pub throw: bool,
    message: RouteMessage,
}

/// A route to install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub dst: IpNetwork,
    pub oif: Option<u32>,
    pub table: u32,
    pub protocol: u8,
    pub priority: Option<u32>,
    pub throw: bool,
}

/// A policy routing rule read back from the kernel.
#[derive(Clone, Debug)]
pub struct Rule {
    pub family: Family,
    pub priority: Option<u32>,
    pub table: u32,
    pub iif: Option<String>,
    message: RuleMessage,
}

pub struct Netlink {
    handle: rtnetlink::Handle,
    conn: JoinHandle<()>,
}

impl Drop for Netlink {
    fn drop(&mut self) {
        self.conn.abort();
    }
}

impl Netlink {
    pub(crate) fn new(handle: rtnetlink::Handle, conn: JoinHandle<()>) -> Self {
        Self { handle, conn }
    }

    /// Looks a link up by name; a missing link is `None`.
    pub async fn link_by_name(&self, name: &str) -> Result<Option<Link>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_owned())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(link_from_message(msg))),
            Ok(None) => Ok(None),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Error::netlink(format!("get link {name}"), e)),
        }
    }

    /// Creates a dummy interface; an existing one is left alone.
    pub async fn add_dummy(&self, name: &str) -> Result<()> {
        match self
            .handle
            .link()
            .add()
            .dummy(name.to_owned())
            .execute()
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => {
                debug!("dummy link {} already exists", name);
                Ok(())
            }
            Err(e) => Err(Error::netlink(format!("add dummy link {name}"), e)),
        }
    }

    pub async fn set_link_up(&self, link: &Link) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .up()
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("set link {} up", link.name), e))
    }

    pub async fn rename_link(&self, link: &Link, to: &str) -> Result<()> {
        self.handle
            .link()
            .set(link.index)
            .name(to.to_owned())
            .execute()
            .await
            .map_err(|e| Error::netlink(format!("rename link {} to {to}", link.name), e))
    }

    /// Deletes a link; one that is already gone is not an error.
    pub async fn del_link(&self, link: &Link) -> Result<()> {
        match self.handle.link().del(link.index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::netlink(format!("delete link {}", link.name), e)),
        }
    }

    /// Routes of `family` in `table`.
    pub async fn routes(&self, family: Family, table: u32) -> Result<Vec<Route>> {
        let version = match family {
            Family::V4 => IpVersion::V4,
            Family::V6 => IpVersion::V6,
        };
        let mut stream = self.handle.route().get(version).execute();
        let mut routes = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| Error::netlink(format!("list {family} routes"), e))?
        {
            if let Some(route) = route_from_message(msg)
                && route.table == table
            {
                routes.push(route);
            }
        }
        Ok(routes)
    }

    /// Installs a route; an identical existing route is not an error.
    pub async fn add_route(&self, spec: &RouteSpec) -> Result<()> {
        let req = self.handle.route().add();
        let res = match spec.dst {
            IpNetwork::V4(net) => {
                with_route_spec(req.v4().destination_prefix(net.ip(), net.prefix()), spec)
                    .execute()
                    .await
            }
            IpNetwork::V6(net) => {
                with_route_spec(req.v6().destination_prefix(net.ip(), net.prefix()), spec)
                    .execute()
                    .await
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("add route {} table {}", spec.dst, spec.table),
                e,
            )),
        }
    }

    /// Deletes exactly the given route record.
    pub async fn del_route(&self, route: &Route) -> Result<()> {
        match self.handle.route().del(route.message.clone()).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("delete route {} table {}", route.dst, route.table),
                e,
            )),
        }
    }

    pub async fn rules(&self, family: Family) -> Result<Vec<Rule>> {
        let version = match family {
            Family::V4 => IpVersion::V4,
            Family::V6 => IpVersion::V6,
        };
        let mut stream = self.handle.rule().get(version).execute();
        let mut rules = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| Error::netlink(format!("list {family} rules"), e))?
        {
            rules.push(rule_from_message(family, msg));
        }
        Ok(rules)
    }

    /// Adds a rule sending matching traffic to `table`; an existing identical
    /// rule is not an error.
    pub async fn add_rule(
        &self,
        family: Family,
        priority: u32,
        table: u32,
        iif: Option<&str>,
    ) -> Result<()> {
        let req = self.handle.rule().add();
        let res = match family {
            Family::V4 => {
                with_rule_spec(req.v4(), priority, table, iif)
                    .execute()
                    .await
            }
            Family::V6 => {
                with_rule_spec(req.v6(), priority, table, iif)
                    .execute()
                    .await
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if is_exists(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("add {family} rule priority {priority} table {table}"),
                e,
            )),
        }
    }

    pub async fn del_rule(&self, rule: &Rule) -> Result<()> {
        match self.handle.rule().del(rule.message.clone()).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::netlink(
                format!("delete {} rule table {}", rule.family, rule.table),
                e,
            )),
        }
    }
}

fn with_route_spec<T>(mut req: RouteAddRequest<T>, spec: &RouteSpec) -> RouteAddRequest<T> {
    req = req
        .table_id(spec.table)
        .protocol(RouteProtocol::from(spec.protocol));
    if let Some(oif) = spec.oif {
        req = req.output_interface(oif);
    }
    if let Some(priority) = spec.priority {
        req = req.priority(priority);
    }
    if spec.throw {
        req.message_mut().header.kind = RouteType::Throw;
    }
    req
}

fn with_rule_spec<T>(
    req: RuleAddRequest<T>,
    priority: u32,
    table: u32,
    iif: Option<&str>,
) -> RuleAddRequest<T> {
    let req = req.priority(priority).table_id(table);
    match iif {
        Some(iif) => req.input_interface(iif.to_owned()),
        None => req,
    }
}

fn link_from_message(msg: LinkMessage) -> Link {
    let name = msg
        .attributes
        .iter()
        .find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
        .unwrap_or_default();
    Link {
        index: msg.header.index,
        name,
    }
}

fn route_from_message(message: RouteMessage) -> Option<Route> {
    let unspecified = match message.header.address_family {
        AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        _ => return None,
    };
    let mut dst = None;
    let mut oif = None;
    let mut priority = None;
    let mut table = u32::from(message.header.table);
    for attr in &message.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => dst = Some(IpAddr::V4(*addr)),
            RouteAttribute::Destination(RouteAddress::Inet6(addr)) => {
                dst = Some(IpAddr::V6(*addr))
            }
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::Priority(p) => priority = Some(*p),
            RouteAttribute::Table(t) => table = *t,
            _ => {}
        }
    }
    let dst = netiputil::network(
        dst.unwrap_or(unspecified),
        message.header.destination_prefix_length,
    )
    .ok()?;
    Some(Route {
        dst,
        oif,
        table,
        protocol: u8::from(message.header.protocol),
        priority,
        throw: message.header.kind == RouteType::Throw,
        message,
    })
}

#[cfg(test)]
impl Route {
    /// A route through `oif`, or a throw route, as the kernel would report it.
    pub(crate) fn from_parts(dst: IpNetwork, oif: Option<u32>, table: u32, throw: bool) -> Self {
        let mut message = RouteMessage::default();
        message.header.destination_prefix_length = dst.prefix();
        message.header.kind = if throw {
            RouteType::Throw
        } else {
            RouteType::Unicast
        };
        message.header.address_family = match dst {
            IpNetwork::V4(_) => AddressFamily::Inet,
            IpNetwork::V6(_) => AddressFamily::Inet6,
        };
        message.attributes.push(RouteAttribute::Destination(match dst.network() {
            IpAddr::V4(addr) => RouteAddress::Inet(addr),
            IpAddr::V6(addr) => RouteAddress::Inet6(addr),
        }));
        message.attributes.push(RouteAttribute::Table(table));
        if let Some(oif) = oif {
            message.attributes.push(RouteAttribute::Oif(oif));
        }
        Self {
            dst,
            oif,
            table,
            protocol: u8::from(message.header.protocol),
            priority: None,
            throw,
            message,
        }
    }
}

fn rule_from_message(family: Family, message: RuleMessage) -> Rule {
    let mut priority = None;
    let mut iif = None;
    let mut table = u32::from(message.header.table);
    for attr in &message.attributes {
        match attr {
            RuleAttribute::Priority(p) => priority = Some(*p),
            RuleAttribute::Table(t) => table = *t,
            RuleAttribute::Iifname(name) => iif = Some(name.clone()),
            _ => {}
        }
    }
    Rule {
        family,
        priority,
        table,
        iif,
        message,
    }
}
