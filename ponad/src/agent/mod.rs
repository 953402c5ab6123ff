pub mod factory;
pub mod server;

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube::runtime::watcher;
use pona_api::cni::v1::cni_server::CniServer;
use pona_crds::v1beta1::egress::Egress;
use pona_k8s_utils::{create_store, node_pod_selector};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::Server;
use tracing::info;

use crate::Result;
use crate::config::AgentArgs;
use crate::http::shutdown;
use crate::metrics::{self, CniMetrics};

pub use factory::{ControllerFactory, KernelFactory, PodControllers};
pub use server::{CniAgent, Stores};

const STORE_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn start(args: AgentArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let client = kube::Client::try_default().await?;

    let pods = create_store(
        Api::<Pod>::all(client.clone()),
        node_pod_selector(&args.node_name),
        Some(STORE_TIMEOUT),
    )
    .await?;
    let services = create_store(
        Api::<Service>::all(client.clone()),
        watcher::Config::default(),
        Some(STORE_TIMEOUT),
    )
    .await?;
    let egresses = create_store(
        Api::<Egress>::all(client.clone()),
        watcher::Config::default(),
        Some(STORE_TIMEOUT),
    )
    .await?;
    info!("caches synced");

    let stores = Stores {
        pods,
        services,
        egresses,
        client: Some(client),
    };
    let factory = KernelFactory::new(args.egress_port, args.exclude_networks.clone());
    let cni_metrics = metrics::register(|r| CniMetrics::default().register(r));
    let agent = CniAgent::new(stores, factory, cni_metrics);

    let mut routes = RoutesBuilder::default();
    routes.add_service(CniServer::new(agent));
    let routes = routes.routes();

    let server = serve(args.socket.clone(), routes, cancel.child_token());
    ready.cancel();
    info!(socket = %args.socket.display(), "serving cni requests");

    server.await
}

pub(crate) async fn serve(path: PathBuf, routes: Routes, cancel: CancellationToken) -> Result<()> {
    if let Err(e) = fs::remove_file(&path)
        && e.kind() != ErrorKind::NotFound
    {
        return Err(e.into());
    }
    let Some(parent) = path.parent() else {
        return Err(std::io::Error::new(
            ErrorKind::NotFound,
            format!("parent of path {} could not resolve", path.display()),
        )
        .into());
    };
    fs::create_dir_all(parent)?;
    let listener = UnixListener::bind(&path)?;
    let stream = UnixListenerStream::new(listener);

    Server::builder()
        .add_routes(routes)
        .serve_with_incoming_shutdown(stream, shutdown(cancel))
        .await?;

    Ok(())
}
