use std::collections::BTreeMap;
use std::str::FromStr;

use ipnetwork::IpNetwork;
use k8s_openapi::api::apps::v1::DeploymentStrategy;
use k8s_openapi::api::core::v1::{PodSpec, SessionAffinityConfig};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::CustomResource;
use kube::KubeSchema;
use schemars::{JsonSchema, json_schema};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const NAME_GROUP_EGRESS: &str = "egresses.pona.cybozu.com";

/// Egress runs a set of NAT gateway pods that masquerade traffic from client
/// pods towards `destinations`.
#[derive(CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Clone, Debug)]
#[kube(
    group = "pona.cybozu.com",
    version = "v1beta1",
    kind = "Egress",
    namespaced,
    status = "EgressStatus",
    shortname = "eg",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct EgressSpec {
    /// Destination networks in CIDR notation routed through this egress.
    #[schemars(length(min = 1))]
    pub destinations: Vec<String>,

    /// Number of gateway pods.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Deployment strategy for the gateway pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub strategy: Option<DeploymentStrategy>,

    /// Pod template for the gateway pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<EgressPodTemplate>,

    /// ClientIP or None, copied to the gateway Service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<SessionAffinity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub session_affinity_config: Option<SessionAffinityConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<EgressPdbSpec>,
}

fn default_replicas() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Copy, Debug, JsonSchema)]
pub enum SessionAffinity {
    #[serde(rename = "ClientIP")]
    ClientIp,
    #[default]
    None,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressPodTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EgressPodMetadata>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_object")]
    pub spec: Option<PodSpec>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
pub struct EgressPodMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressPdbSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "int_or_string")]
    pub min_available: Option<IntOrString>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "int_or_string")]
    pub max_unavailable: Option<IntOrString>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug, JsonSchema)]
pub struct EgressStatus {
    /// Number of gateway pods currently running.
    #[serde(default)]
    pub replicas: i32,

    /// Label selector of the gateway pods.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
}

impl EgressSpec {
    /// Parses every destination into a network, failing on the first invalid one.
    pub fn destination_networks(&self) -> Result<Vec<IpNetwork>> {
        self.destinations
            .iter()
            .map(|d| {
                IpNetwork::from_str(d).map_err(|source| Error::InvalidDestination {
                    destination: d.clone(),
                    source,
                })
            })
            .collect()
    }
}

fn preserve_unknown_object(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
    })
}

fn int_or_string(_: &mut schemars::generate::SchemaGenerator) -> schemars::Schema {
    json_schema!({
        "x-kubernetes-int-or-string": true,
    })
}
