pub mod agent;
pub mod annotation;
pub mod cni;
pub mod config;
pub mod egress;
pub mod http;
pub mod kernel;
pub mod metrics;
pub mod nat;
pub mod netiputil;
pub mod tunnel;

use std::net::IpAddr;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no local address configured for the family of {0}")]
    IpFamilyMismatch(IpAddr),

    #[error("netlink: failed to {op}: {source}")]
    Netlink {
        op: String,
        #[source]
        source: rtnetlink::Error,
    },

    #[error("{program} {} failed with {status}: {stderr}", .args.join(" "))]
    Command {
        program: String,
        args: Vec<String>,
        status: ExitStatus,
        stderr: String,
    },

    #[error("setting sysctl {key} failed: {source}")]
    Sysctl {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pod tracker invariant violated: {0}")]
    InvariantViolation(String),

    #[error("link {0} not found")]
    LinkNotFound(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("invalid network: {0}")]
    IpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("network namespace provided is invalid: {0}")]
    NetNs(#[from] netns_rs::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("{0}")]
    TonicTransport(#[from] tonic::transport::Error),

    #[error("utils error: {0}")]
    UtilsError(#[from] pona_k8s_utils::Error),

    #[error("crd error: {0}")]
    CrdError(#[from] pona_crds::Error),

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn netlink(op: impl Into<String>, source: rtnetlink::Error) -> Self {
        Self::Netlink {
            op: op.into(),
            source,
        }
    }
}
