//! Access to kernel networking state: rtnetlink for links, routes and rules,
//! iproute2/iptables/modprobe for what rtnetlink does not cover, and sysctl
//! writes. Everything runs in the network namespace the [`Kernel`] was
//! connected to.

pub mod iptables;
pub mod netlink;
pub mod netns;

pub use netlink::{Link, Netlink, Route, RouteSpec, Rule};
pub use netns::NetNs;

use crate::Result;

/// Handle to one network namespace.
pub struct Kernel {
    pub ns: NetNs,
    pub netlink: Netlink,
}

impl Kernel {
    pub async fn connect(ns: NetNs) -> Result<Self> {
        let netlink = ns.netlink().await?;
        Ok(Self { ns, netlink })
    }
}

/// errno carried by a netlink error reply, as a positive value.
pub(crate) fn errno(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|code| -code.get()),
        _ => None,
    }
}

pub(crate) fn is_exists(err: &rtnetlink::Error) -> bool {
    errno(err) == Some(nix::libc::EEXIST)
}

pub(crate) fn is_not_found(err: &rtnetlink::Error) -> bool {
    matches!(
        errno(err),
        Some(nix::libc::ENOENT) | Some(nix::libc::ENODEV) | Some(nix::libc::ESRCH)
    )
}
