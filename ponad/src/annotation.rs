//! Pods opt into egress NAT with annotations of the form
//! `egress.pona.cybozu.com/<egress namespace>: <name>[,<name>...]`.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use pona_crds::EGRESS_ANNOTATION_PREFIX;

/// An Egress a pod asks to be routed through.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EgressRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for EgressRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub fn is_host_network(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.host_network)
        .unwrap_or(false)
}

/// All egresses referenced by `pod`, in annotation order. Host network pods
/// never reference any.
pub fn egress_refs(pod: &Pod) -> Vec<EgressRef> {
    if is_host_network(pod) {
        return Vec::new();
    }
    let mut refs = Vec::new();
    for (key, value) in pod.annotations() {
        let Some(namespace) = key.strip_prefix(EGRESS_ANNOTATION_PREFIX) else {
            continue;
        };
        refs.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| EgressRef {
                    namespace: namespace.to_owned(),
                    name: name.to_owned(),
                }),
        );
    }
    refs
}

/// Whether `pod` asks for the egress `namespace/name`.
pub fn references(pod: &Pod, namespace: &str, name: &str) -> bool {
    let Some(value) = pod
        .annotations()
        .get(&format!("{EGRESS_ANNOTATION_PREFIX}{namespace}"))
    else {
        return false;
    };
    value == name || value.split(',').any(|item| item.trim() == name)
}
