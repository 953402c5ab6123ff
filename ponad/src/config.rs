use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ipnetwork::IpNetwork;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Node daemon serving the pona CNI plugin
    Agent(AgentArgs),
    /// NAT runtime inside an egress gateway pod
    Egress(EgressArgs),
    /// Print the Egress CustomResourceDefinition
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Unix socket the CNI plugin connects to
    #[arg(long, env = "PONAD_SOCKET", default_value = "/run/ponad.sock")]
    pub socket: PathBuf,

    /// UDP port of the FoU tunnels
    #[arg(long, env = "PONA_EGRESS_PORT", default_value_t = 5555)]
    pub egress_port: u16,

    /// Metrics listener for agent
    #[arg(long, default_value = "0.0.0.0:9384")]
    pub metrics_address: SocketAddr,

    /// Name of the node the program is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// CNI Bin directory
    #[arg(long, env = "CNI_BIN_DIR", default_value = "/opt/cni/bin")]
    pub cni_bin_dir: PathBuf,

    /// CNI configuration directory
    #[arg(long, env = "CNI_CONF_DIR", default_value = "/etc/cni/net.d")]
    pub cni_conf_dir: PathBuf,

    /// CNI plugin log path
    #[arg(long, env = "CNI_PLUGIN_LOG_PATH", default_value = "/var/log/pona")]
    pub cni_plugin_log_dir: PathBuf,

    /// Do not install the plugin binary and network configuration
    #[arg(long)]
    pub skip_cni_install: bool,

    /// Networks kept off the egress tunnels, replacing the private ranges.
    /// Link-local ranges are always excluded.
    #[arg(long = "exclude-network")]
    pub exclude_networks: Vec<IpNetwork>,
}

#[derive(Parser, Debug, Clone)]
pub struct EgressArgs {
    /// Name of the Egress this gateway serves
    #[arg(long, env = "PONA_EGRESS_NAME")]
    pub egress_name: String,

    /// Namespace of the Egress this gateway serves
    #[arg(long, env = "PONA_POD_NAMESPACE")]
    pub egress_namespace: String,

    /// Addresses of the gateway pod, used as tunnel endpoints
    #[arg(long, env = "PONA_POD_ADDRESSES", value_delimiter = ',', required = true)]
    pub pod_addresses: Vec<IpAddr>,

    /// Interface masqueraded traffic leaves through
    #[arg(long, default_value = "eth0")]
    pub iface: String,

    /// UDP port of the FoU tunnels
    #[arg(long, env = "PONA_EGRESS_PORT", default_value_t = 5555)]
    pub egress_port: u16,

    /// Metrics listener for the gateway
    #[arg(long, default_value = "0.0.0.0:9384")]
    pub metrics_address: SocketAddr,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_egress_args() {
        let cli = Cli::parse_from([
            "ponad",
            "egress",
            "--egress-name",
            "nat",
            "--egress-namespace",
            "internet",
            "--pod-addresses",
            "10.64.0.3,fd02::3",
        ]);
        let Commands::Egress(args) = cli.command else {
            panic!("expected egress command");
        };
        assert_eq!(args.pod_addresses.len(), 2);
        assert_eq!(args.iface, "eth0");
        assert_eq!(args.egress_port, 5555);
    }

    #[test]
    fn test_agent_args() {
        let cli = Cli::parse_from([
            "ponad",
            "agent",
            "--node-name",
            "node-1",
            "--exclude-network",
            "10.0.0.0/8",
            "--exclude-network",
            "fd00::/8",
        ]);
        let Commands::Agent(args) = cli.command else {
            panic!("expected agent command");
        };
        assert_eq!(args.socket, PathBuf::from("/run/ponad.sock"));
        assert_eq!(args.exclude_networks.len(), 2);
        assert!(!args.skip_cni_install);
    }
}
