use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnetwork::IpNetwork;

use crate::Result;
use crate::kernel::{Kernel, NetNs};
use crate::nat::{NatClient, NatClientController};
use crate::tunnel::{FouTunnel, TunnelController};

/// Controllers acting on one pod network namespace.
pub struct PodControllers {
    pub tunnel: Arc<dyn TunnelController>,
    pub nat: Arc<dyn NatClient>,
}

/// Builds the controllers for a pod being attached.
#[tonic::async_trait]
pub trait ControllerFactory: Send + Sync + 'static {
    async fn build(
        &self,
        netns: &str,
        local4: Option<Ipv4Addr>,
        local6: Option<Ipv6Addr>,
    ) -> Result<PodControllers>;
}

/// Production factory programming the kernel inside the pod's namespace.
pub struct KernelFactory {
    port: u16,
    exclude: Vec<IpNetwork>,
}

impl KernelFactory {
    pub fn new(port: u16, exclude: Vec<IpNetwork>) -> Self {
        Self { port, exclude }
    }
}

#[tonic::async_trait]
impl ControllerFactory for KernelFactory {
    async fn build(
        &self,
        netns: &str,
        local4: Option<Ipv4Addr>,
        local6: Option<Ipv6Addr>,
    ) -> Result<PodControllers> {
        let kernel = Arc::new(Kernel::connect(NetNs::from_path(netns)).await?);
        Ok(PodControllers {
            tunnel: Arc::new(FouTunnel::new(kernel.clone(), self.port, local4, local6)),
            nat: Arc::new(NatClientController::new(
                kernel,
                local4,
                local6,
                &self.exclude,
            )),
        })
    }
}
