use thiserror::Error;

pub mod v1beta1;

use kube::CustomResourceExt;

/// Annotation prefix a pod uses to opt into egress gateways. The full key is
/// the prefix followed by the namespace of the Egress resources.
pub const EGRESS_ANNOTATION_PREFIX: &str = "egress.pona.cybozu.com/";

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("yaml error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("invalid destination {destination}: {source}")]
    InvalidDestination {
        destination: String,
        source: ipnetwork::IpNetworkError,
    },
}

pub fn crd_gen_egress() -> Result<()> {
    print!(
        "---\n{}",
        serde_yaml::to_string(&v1beta1::egress::Egress::crd())?
    );
    Ok(())
}
