//! Policy routing for egress NAT.
//!
//! The gateway side masquerades traffic that arrives over client tunnels and
//! routes replies back into them. The client side sends traffic for the
//! egress destinations into a tunnel while throwing private and link-local
//! ranges back to the main table.

pub mod client;
pub mod gateway;
#[cfg(test)]
pub mod memory;

use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::Result;
use crate::kernel::Link;

pub use client::NatClientController;
pub use gateway::NatGatewayController;

/// Route protocol id tagging routes installed by pona.
pub const ROUTE_PROTOCOL: u8 = 30;

pub const GATEWAY_TABLE: u32 = 118;
pub const GATEWAY_RULE_PRIORITY: u32 = 2000;

pub const CLIENT_TABLE: u32 = 117;
pub const CLIENT_RULE_PRIORITY: u32 = 1900;

#[tonic::async_trait]
pub trait NatGateway: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn is_initialized(&self) -> Result<bool>;

    /// Routes replies for `addr` through `link`.
    async fn add_client(&self, addr: IpAddr, link: &Link) -> Result<()>;
}

#[tonic::async_trait]
pub trait NatClient: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn is_initialized(&self) -> Result<bool>;

    /// Converges the routes via `link` to exactly `subnets`.
    async fn update_routes(&self, link: &Link, subnets: &[IpNetwork]) -> Result<()>;
}
