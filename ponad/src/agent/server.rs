use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Client, Resource};
use pona_api::cni::v1::cni_server::Cni;
use pona_api::cni::v1::{AddResponse, CniArgs, CniError, ErrorCode};
use pona_api::{POD_NAME_KEY, POD_NAMESPACE_KEY};
use pona_crds::v1beta1::egress::Egress;
use prost::Message;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, warn};

use crate::agent::factory::ControllerFactory;
use crate::annotation::{self, EgressRef};
use crate::metrics::CniMetrics;
use crate::netiputil::{self, Family};

/// Cached cluster state the server reads from. `client` is used for objects
/// that are not in the cache yet.
pub struct Stores {
    pub pods: Store<Pod>,
    pub services: Store<Service>,
    pub egresses: Store<Egress>,
    pub client: Option<Client>,
}

/// Serves the CNI plugin: on ADD, routes the pod's traffic for every egress
/// it references through a tunnel to that egress.
pub struct CniAgent<F> {
    stores: Stores,
    factory: F,
    metrics: CniMetrics,
}

fn cni_status(
    code: Code,
    cni_code: ErrorCode,
    msg: impl Into<String>,
    details: impl Into<String>,
) -> Status {
    let msg = msg.into();
    let err = CniError {
        code: cni_code as i32,
        msg: msg.clone(),
        details: details.into(),
    };
    Status::with_details(code, msg, Bytes::from(err.encode_to_vec()))
}

fn internal(msg: impl Into<String>, err: impl Display) -> Status {
    cni_status(Code::Internal, ErrorCode::Internal, msg, err.to_string())
}

/// Parses the `grpc-timeout` header set by clients with a deadline.
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(n.checked_mul(3600)?),
        "M" => Duration::from_secs(n.checked_mul(60)?),
        "S" => Duration::from_secs(n),
        "m" => Duration::from_millis(n),
        "u" => Duration::from_micros(n),
        "n" => Duration::from_nanos(n),
        _ => return None,
    };
    Some(timeout)
}

fn check_deadline(deadline: Option<Instant>) -> Result<(), Status> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Err(Status::deadline_exceeded("deadline exceeded before routing completed"))
        }
        _ => Ok(()),
    }
}

#[derive(Deserialize)]
struct NetConf {
    #[serde(rename = "prevResult", default)]
    prev_result: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct PrevResultIps {
    #[serde(default)]
    ips: Vec<IpConfig>,
}

#[derive(Deserialize)]
struct IpConfig {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

/// The previous plugin's result, kept verbatim, and the pod's addresses
/// taken from it.
struct PrevResult {
    raw: Box<RawValue>,
    local4: Option<Ipv4Addr>,
    local6: Option<Ipv6Addr>,
}

fn parse_prev_result(stdin: &[u8]) -> Result<Option<PrevResult>, serde_json::Error> {
    let conf: NetConf = serde_json::from_slice(stdin)?;
    let Some(raw) = conf.prev_result else {
        return Ok(None);
    };
    let parsed: PrevResultIps = serde_json::from_str(raw.get())?;

    let mut local4 = None;
    let mut local6 = None;
    for ip in &parsed.ips {
        let addr = ip
            .address
            .as_deref()
            .and_then(|a| IpNetwork::from_str(a).ok())
            .map(|n| n.ip())
            .or_else(|| ip.gateway.as_deref().and_then(|g| g.parse().ok()));
        match addr {
            Some(IpAddr::V4(a)) if local4.is_none() => local4 = Some(a),
            Some(IpAddr::V6(a)) if local6.is_none() => local6 = Some(a),
            _ => {}
        }
    }
    Ok(Some(PrevResult {
        raw,
        local4,
        local6,
    }))
}

fn pod_key(args: &CniArgs) -> Result<(String, String), Status> {
    let get = |key: &str| args.args.get(key).filter(|v| !v.is_empty()).cloned();
    match (get(POD_NAMESPACE_KEY), get(POD_NAME_KEY)) {
        (Some(namespace), Some(name)) => Ok((namespace, name)),
        _ => Err(cni_status(
            Code::InvalidArgument,
            ErrorCode::InvalidEnvironmentVariables,
            "missing pod name or namespace",
            format!("{:?}", args.args),
        )),
    }
}

impl<F: ControllerFactory> CniAgent<F> {
    pub fn new(stores: Stores, factory: F, metrics: CniMetrics) -> Self {
        Self {
            stores,
            factory,
            metrics,
        }
    }

    /// Reads `namespace/name` from `store`, asking the API server on a miss.
    async fn lookup<K>(
        &self,
        store: &Store<K>,
        namespace: &str,
        name: &str,
    ) -> crate::Result<Option<Arc<K>>>
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + std::fmt::Debug
            + 'static,
    {
        if let Some(obj) = store.get(&ObjectRef::new(name).within(namespace)) {
            return Ok(Some(obj));
        }
        let Some(client) = self.stores.client.clone() else {
            return Ok(None);
        };
        debug!(kind = %K::kind(&()), "{namespace}/{name} not cached, asking the API server");
        let obj = Api::<K>::namespaced(client, namespace).get_opt(name).await?;
        Ok(obj.map(Arc::new))
    }

    /// The tunnel peer for `egress` and the destinations routed to it.
    async fn destinations(&self, egress: &EgressRef) -> Result<(IpAddr, Vec<IpNetwork>), Status> {
        let not_found = |kind: &str| {
            cni_status(
                Code::FailedPrecondition,
                ErrorCode::Internal,
                format!("failed to get {kind} {egress}"),
                "not found",
            )
        };
        let eg = self
            .lookup(&self.stores.egresses, &egress.namespace, &egress.name)
            .await
            .map_err(|e| internal(format!("failed to get Egress {egress}"), e))?
            .ok_or_else(|| not_found("Egress"))?;
        let svc = self
            .lookup(&self.stores.services, &egress.namespace, &egress.name)
            .await
            .map_err(|e| internal(format!("failed to get Service {egress}"), e))?
            .ok_or_else(|| not_found("Service"))?;

        let cluster_ip = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.cluster_ip.as_deref())
            .unwrap_or_default();
        let gateway: IpAddr = cluster_ip.parse().map_err(|_| {
            cni_status(
                Code::Internal,
                ErrorCode::Internal,
                format!("invalid ClusterIP in Service {egress}"),
                cluster_ip,
            )
        })?;
        let networks = eg
            .spec
            .destination_networks()
            .map_err(|e| internal(format!("invalid network in Egress {egress}"), e))?;
        Ok((
            gateway,
            netiputil::filter_family(&networks, Family::of(&gateway)),
        ))
    }

    async fn add_pod(&self, args: CniArgs, deadline: Option<Instant>) -> Result<Vec<u8>, Status> {
        let (namespace, name) = pod_key(&args)?;
        let pod = match self.lookup(&self.stores.pods, &namespace, &name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                return Err(cni_status(
                    Code::NotFound,
                    ErrorCode::UnknownContainer,
                    "pod not found",
                    format!("{namespace}/{name}"),
                ));
            }
            Err(e) => return Err(internal("failed to get pod", e)),
        };

        let egresses = annotation::egress_refs(&pod);
        if egresses.is_empty() {
            debug!("pod {namespace}/{name} uses no egress");
            return Ok(Vec::new());
        }

        let prev = parse_prev_result(&args.stdin_data).map_err(|e| {
            cni_status(
                Code::InvalidArgument,
                ErrorCode::DecodingFailure,
                "failed to parse network configuration",
                e.to_string(),
            )
        })?;
        let Some(prev) = prev else {
            return Err(cni_status(
                Code::InvalidArgument,
                ErrorCode::InvalidNetworkConfig,
                "missing prevResult",
                "pona must be chained after a plugin that assigns addresses",
            ));
        };

        let controllers = self
            .factory
            .build(&args.netns, prev.local4, prev.local6)
            .await
            .map_err(|e| internal("failed to open pod network namespace", e))?;
        controllers
            .tunnel
            .init()
            .await
            .map_err(|e| internal("failed to initialize fou tunnel", e))?;
        let nat_ready = controllers
            .nat
            .is_initialized()
            .await
            .map_err(|e| internal("failed to inspect nat client", e))?;
        if !nat_ready {
            controllers
                .nat
                .init()
                .await
                .map_err(|e| internal("failed to initialize nat client", e))?;
        }

        for egress in &egresses {
            check_deadline(deadline)?;
            let (gateway, subnets) = self.destinations(egress).await?;
            let link = controllers
                .tunnel
                .add_peer(gateway)
                .await
                .map_err(|e| internal(format!("failed to add peer for {gateway}"), e))?;
            controllers
                .nat
                .update_routes(&link, &subnets)
                .await
                .map_err(|e| internal("failed to update routes", e))?;
            info!(
                pod = %format!("{namespace}/{name}"),
                %egress,
                %gateway,
                "egress routes configured"
            );
        }

        Ok(prev.raw.get().as_bytes().to_vec())
    }
}

#[tonic::async_trait]
impl<F: ControllerFactory> Cni for CniAgent<F> {
    async fn add(
        &self,
        request: Request<CniArgs>,
    ) -> std::result::Result<Response<AddResponse>, Status> {
        let start = Instant::now();
        let deadline = grpc_timeout(request.metadata()).map(|timeout| start + timeout);
        let args = request.into_inner();
        debug!(container = %args.container_id, netns = %args.netns, "received add request");

        let res = self.add_pod(args, deadline).await;
        let code = match &res {
            Ok(_) => Code::Ok,
            Err(status) => {
                warn!(code = ?status.code(), "add failed: {}", status.message());
                status.code()
            }
        };
        self.metrics.observe("ADD", code, start);
        res.map(|result| Response::new(AddResponse { result }))
    }

    // Teardown follows the pod's lifecycle in the cluster, not CNI DEL.
    async fn del(&self, request: Request<CniArgs>) -> std::result::Result<Response<()>, Status> {
        let start = Instant::now();
        debug!(container = %request.get_ref().container_id, "received del request");
        self.metrics.observe("DEL", Code::Ok, start);
        Ok(Response::new(()))
    }

    async fn check(&self, request: Request<CniArgs>) -> std::result::Result<Response<()>, Status> {
        let start = Instant::now();
        debug!(container = %request.get_ref().container_id, "received check request");
        self.metrics.observe("CHECK", Code::Ok, start);
        Ok(Response::new(()))
    }
}
