use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use tracing::{debug, info};

use crate::kernel::iptables::Iptables;
use crate::kernel::netns::modprobe;
use crate::kernel::{Kernel, Link};
use crate::netiputil::Family;
use crate::tunnel::{TunnelController, link_name};
use crate::{Error, Result};

/// Marks a namespace whose FoU setup has completed.
pub const SENTINEL: &str = "fou-dummy";

const TTL: &str = "64";

/// Flow based receive device and the name given to the device the kernel
/// creates on its own when the tunnel module is loaded.
struct FlowDevice {
    name: &'static str,
    kind: &'static str,
    fallback: &'static str,
    renamed: &'static str,
}

const FLOW_V4: FlowDevice = FlowDevice {
    name: "pona_ipip4",
    kind: "ipip",
    fallback: "tunl0",
    renamed: "pona_tunl",
};

const FLOW_V6: FlowDevice = FlowDevice {
    name: "pona_ipip6",
    kind: "ip6tnl",
    fallback: "ip6tnl0",
    renamed: "pona_ip6tnl",
};

/// Tunnels encapsulated in UDP with the kernel's fou module.
pub struct FouTunnel {
    port: u16,
    local4: Option<Ipv4Addr>,
    local6: Option<Ipv6Addr>,
    kernel: Arc<Kernel>,
}

impl FouTunnel {
    pub fn new(
        kernel: Arc<Kernel>,
        port: u16,
        local4: Option<Ipv4Addr>,
        local6: Option<Ipv6Addr>,
    ) -> Self {
        Self {
            port,
            local4,
            local6,
            kernel,
        }
    }

    /// Protocol carried inside the UDP payload: IPIP or IPv6-in-IP.
    fn ipproto(family: Family) -> u8 {
        match family {
            Family::V4 => 4,
            Family::V6 => 41,
        }
    }

    fn ip_args(family: Family, args: &[&str]) -> Vec<String> {
        let mut out = Vec::with_capacity(args.len() + 1);
        if family == Family::V6 {
            out.push("-6".to_owned());
        }
        out.extend(args.iter().map(|a| a.to_string()));
        out
    }

    async fn fou_port_exists(&self, family: Family) -> Result<bool> {
        let out = self
            .kernel
            .ns
            .exec("ip", &Self::ip_args(family, &["fou", "show"]))
            .await?;
        Ok(fou_ports(&out).contains(&(self.port, Self::ipproto(family))))
    }

    async fn add_fou_port(&self, family: Family) -> Result<()> {
        let port = self.port.to_string();
        let ipproto = Self::ipproto(family).to_string();
        let args = Self::ip_args(family, &["fou", "add", "port", &port, "ipproto", &ipproto]);
        if let Err(e) = self.kernel.ns.exec("ip", &args).await {
            if self.fou_port_exists(family).await? {
                debug!("{family} fou port {} already registered", self.port);
                return Ok(());
            }
            return Err(e);
        }
        info!("registered {family} fou port {}", self.port);
        Ok(())
    }

    fn checksum_rule(&self) -> Vec<String> {
        [
            "-p",
            "udp",
            "--dport",
            &self.port.to_string(),
            "-j",
            "CHECKSUM",
            "--checksum-fill",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    async fn init_family(&self, family: Family) -> Result<()> {
        let ns = &self.kernel.ns;
        match family {
            Family::V4 => {
                ns.sysctl("net.ipv4.conf.default.rp_filter", "0").await?;
                ns.sysctl("net.ipv4.conf.all.rp_filter", "0").await?;
                ns.sysctl("net.ipv4.ip_forward", "1").await?;
                modprobe("fou").await?;
            }
            Family::V6 => {
                ns.sysctl("net.ipv6.conf.all.forwarding", "1").await?;
                modprobe("fou6").await?;
            }
        }
        self.add_fou_port(family).await?;

        // kube-proxy rewrites the destination after the checksum is computed
        Iptables::new(family)
            .insert_unique(ns, "mangle", "POSTROUTING", 1, &self.checksum_rule())
            .await
    }

    /// Creates `name` with `args` unless it exists, tolerating a concurrent
    /// creator.
    async fn ensure_link(&self, name: &str, args: &[String]) -> Result<Link> {
        let netlink = &self.kernel.netlink;
        if let Some(link) = netlink.link_by_name(name).await? {
            return Ok(link);
        }
        if let Err(e) = self.kernel.ns.exec("ip", args).await {
            return match netlink.link_by_name(name).await? {
                Some(link) => {
                    debug!("link {name} was created concurrently");
                    Ok(link)
                }
                None => Err(e),
            };
        }
        netlink
            .link_by_name(name)
            .await?
            .ok_or_else(|| Error::LinkNotFound(name.to_owned()))
    }

    async fn ensure_flow_device(&self, family: Family) -> Result<()> {
        let dev = match family {
            Family::V4 => &FLOW_V4,
            Family::V6 => &FLOW_V6,
        };
        let args = Self::ip_args(
            family,
            &["link", "add", dev.name, "type", dev.kind, "external"],
        );
        let link = self.ensure_link(dev.name, &args).await?;
        self.kernel.netlink.set_link_up(&link).await?;

        if let Some(fallback) = self.kernel.netlink.link_by_name(dev.fallback).await? {
            self.kernel
                .netlink
                .rename_link(&fallback, dev.renamed)
                .await?;
            debug!("renamed {} to {}", dev.fallback, dev.renamed);
        }
        Ok(())
    }

    fn families(&self) -> Vec<Family> {
        let mut families = Vec::with_capacity(2);
        if self.local4.is_some() {
            families.push(Family::V4);
        }
        if self.local6.is_some() {
            families.push(Family::V6);
        }
        families
    }
}

fn peer_link_args(
    port: u16,
    local4: Option<Ipv4Addr>,
    local6: Option<Ipv6Addr>,
    name: &str,
    addr: IpAddr,
) -> Result<Vec<String>> {
    let port = port.to_string();
    let args = match addr {
        IpAddr::V4(remote) => {
            let local = local4.ok_or(Error::IpFamilyMismatch(addr))?;
            FouTunnel::ip_args(
                Family::V4,
                &[
                    "link",
                    "add",
                    name,
                    "type",
                    "ipip",
                    "remote",
                    &remote.to_string(),
                    "local",
                    &local.to_string(),
                    "ttl",
                    TTL,
                    "encap",
                    "fou",
                    "encap-sport",
                    "auto",
                    "encap-dport",
                    &port,
                ],
            )
        }
        IpAddr::V6(remote) => {
            let local = local6.ok_or(Error::IpFamilyMismatch(addr))?;
            FouTunnel::ip_args(
                Family::V6,
                &[
                    "link",
                    "add",
                    name,
                    "type",
                    "ip6tnl",
                    "mode",
                    "ip6ip6",
                    "remote",
                    &remote.to_string(),
                    "local",
                    &local.to_string(),
                    "hoplimit",
                    TTL,
                    "encap",
                    "fou",
                    "encap-sport",
                    "auto",
                    "encap-dport",
                    &port,
                ],
            )
        }
    };
    Ok(args)
}

#[tonic::async_trait]
impl TunnelController for FouTunnel {
    async fn init(&self) -> Result<()> {
        if self.is_initialized().await? {
            return Ok(());
        }
        for family in self.families() {
            self.init_family(family).await?;
        }
        self.kernel.netlink.add_dummy(SENTINEL).await?;
        info!(ns = %self.kernel.ns, port = self.port, "fou tunnel initialized");
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.kernel.netlink.link_by_name(SENTINEL).await?.is_some())
    }

    async fn add_peer(&self, addr: IpAddr) -> Result<Link> {
        let name = link_name(addr);
        if let Some(link) = self.kernel.netlink.link_by_name(&name).await? {
            return Ok(link);
        }
        let args = peer_link_args(self.port, self.local4, self.local6, &name, addr)?;
        let link = self.ensure_link(&name, &args).await?;
        self.ensure_flow_device(Family::of(&addr)).await?;
        info!(peer = %addr, link = %link.name, "added fou tunnel");
        Ok(link)
    }

    async fn del_peer(&self, addr: IpAddr) -> Result<()> {
        let name = link_name(addr);
        match self.kernel.netlink.link_by_name(&name).await? {
            Some(link) => {
                self.kernel.netlink.del_link(&link).await?;
                info!(peer = %addr, link = %name, "deleted fou tunnel");
            }
            None => debug!(peer = %addr, "no tunnel to delete"),
        }
        Ok(())
    }
}

/// `(port, ipproto)` of every receive port listed by `ip fou show`. Fields
/// are read by key, so their order and any extra attributes do not matter.
// rtnetlink cannot list FoU ports (they live in generic netlink).
fn fou_ports(out: &str) -> Vec<(u16, u8)> {
    out.lines()
        .filter_map(|line| {
            let mut port = None;
            let mut ipproto = None;
            let mut tokens = line.split_whitespace();
            while let Some(key) = tokens.next() {
                match key {
                    "port" => port = tokens.next().and_then(|v| v.parse().ok()),
                    "ipproto" => ipproto = tokens.next().and_then(|v| v.parse().ok()),
                    _ => {}
                }
            }
            Some((port?, ipproto?))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fou_ports() {
        let out = "port 5555 ipproto 4\nlocal 10.0.0.1 port 5555 ipproto 41\nport 15555 gue\n";
        assert_eq!(fou_ports(out), vec![(5555, 4), (5555, 41)]);
        assert!(!fou_ports("port 55555 ipproto 4").contains(&(5555, 4)));
        assert!(fou_ports("").is_empty());
    }

    #[test]
    fn test_peer_link_args_v4() -> Result<()> {
        let args = peer_link_args(
            5555,
            Some(Ipv4Addr::new(10, 244, 1, 7)),
            None,
            "fou4_0a600005",
            "10.96.0.5".parse()?,
        )?;
        assert_eq!(
            args.join(" "),
            "link add fou4_0a600005 type ipip remote 10.96.0.5 local 10.244.1.7 ttl 64 \
             encap fou encap-sport auto encap-dport 5555"
        );
        Ok(())
    }

    #[test]
    fn test_peer_link_args_v6() -> Result<()> {
        let args = peer_link_args(
            5555,
            None,
            Some("fd00::7".parse()?),
            "fou6_01020304",
            "fd00::5".parse()?,
        )?;
        assert_eq!(args[0], "-6");
        assert!(args.join(" ").contains("type ip6tnl mode ip6ip6 remote fd00::5 local fd00::7"));
        Ok(())
    }

    #[test]
    fn test_peer_link_args_family_mismatch() {
        let err = peer_link_args(
            5555,
            Some(Ipv4Addr::new(10, 244, 1, 7)),
            None,
            "fou6_01020304",
            "fd00::5".parse().unwrap(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::IpFamilyMismatch(_)));
    }
}
