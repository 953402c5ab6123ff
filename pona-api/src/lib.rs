pub mod cni {
    pub mod v1 {
        tonic::include_proto!("pona.cni.v1");
    }
}

/// CNI_ARGS key holding the pod name.
pub const POD_NAME_KEY: &str = "K8S_POD_NAME";
/// CNI_ARGS key holding the pod namespace.
pub const POD_NAMESPACE_KEY: &str = "K8S_POD_NAMESPACE";
/// CNI_ARGS key holding the sandbox container id.
pub const POD_CONTAINER_KEY: &str = "K8S_POD_INFRA_CONTAINER_ID";
