//! Runtime of an egress gateway pod: tunnels to every client pod that asks
//! for this egress, with masquerade towards the destinations.

pub mod tracker;

use std::net::IpAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::EgressArgs;
use crate::kernel::{Kernel, NetNs};
use crate::metrics::{self, TrackerMetrics};
use crate::nat::{NatGateway, NatGatewayController};
use crate::netiputil::{self, Family};
use crate::tunnel::{FouTunnel, TunnelController};

pub use tracker::{PodKey, PodTracker};

const RETRY_DELAY: Duration = Duration::from_secs(5);

fn locals(addrs: &[IpAddr]) -> (Option<std::net::Ipv4Addr>, Option<std::net::Ipv6Addr>) {
    let local4 = match netiputil::first_of_family(addrs, Family::V4) {
        Some(IpAddr::V4(addr)) => Some(addr),
        _ => None,
    };
    let local6 = match netiputil::first_of_family(addrs, Family::V6) {
        Some(IpAddr::V6(addr)) => Some(addr),
        _ => None,
    };
    (local4, local6)
}

pub async fn start(args: EgressArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let (local4, local6) = locals(&args.pod_addresses);
    let kernel = Arc::new(Kernel::connect(NetNs::Host).await?);

    let tunnel = Arc::new(FouTunnel::new(
        kernel.clone(),
        args.egress_port,
        local4,
        local6,
    ));
    tunnel.init().await?;
    let gateway = Arc::new(NatGatewayController::new(
        kernel,
        args.iface.clone(),
        local4,
        local6,
    ));
    gateway.init().await?;

    let tracker = PodTracker::new(
        args.egress_name.clone(),
        args.egress_namespace.clone(),
        tunnel,
        gateway,
    )
    .with_metrics(metrics::register(|r| TrackerMetrics::default().register(r)));
    info!(
        egress = %format!("{}/{}", args.egress_namespace, args.egress_name),
        "egress gateway initialized"
    );

    let client = Client::try_default().await?;
    run(Arc::new(tracker), Api::all(client), ready, cancel).await
}

/// Feeds pod events into `tracker` until cancelled. Failed reconciles are
/// retried after [`RETRY_DELAY`] against the latest cached pod.
pub async fn run(
    tracker: Arc<PodTracker>,
    api: Api<Pod>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let (reader, writer) = reflector::store::<Pod>();
    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer);
    let mut stream = pin!(stream);
    let (retry_tx, mut retry_rx) = mpsc::channel::<PodKey>(1024);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(key) = retry_rx.recv() => {
                let pod = cached(&reader, &key);
                handle(&tracker, key, pod.as_deref(), &retry_tx, &cancel).await;
            }
            event = stream.next() => match event {
                Some(Ok(watcher::Event::Apply(pod))) | Some(Ok(watcher::Event::InitApply(pod))) => {
                    handle(&tracker, PodKey::from_pod(&pod), Some(&pod), &retry_tx, &cancel).await;
                }
                Some(Ok(watcher::Event::Delete(pod))) => {
                    handle(&tracker, PodKey::from_pod(&pod), None, &retry_tx, &cancel).await;
                }
                Some(Ok(watcher::Event::InitDone)) => {
                    // pods deleted while the watch was down never get a Delete event
                    for key in tracker.tracked().await {
                        if cached(&reader, &key).is_none() {
                            handle(&tracker, key, None, &retry_tx, &cancel).await;
                        }
                    }
                    ready.cancel();
                    info!("pod watcher synced");
                }
                Some(Ok(watcher::Event::Init)) => {}
                Some(Err(e)) => warn!("pod watch error: {e}"),
                None => break,
            }
        }
    }
    info!("pod watcher stopped");
    Ok(())
}

fn cached(store: &Store<Pod>, key: &PodKey) -> Option<Arc<Pod>> {
    store.get(&ObjectRef::new(&key.name).within(&key.namespace))
}

async fn handle(
    tracker: &PodTracker,
    key: PodKey,
    pod: Option<&Pod>,
    retry: &mpsc::Sender<PodKey>,
    cancel: &CancellationToken,
) {
    if let Err(e) = tracker.reconcile(&key, pod).await {
        error!(pod = %key, "reconcile failed, retrying in {:?}: {e}", RETRY_DELAY);
        let retry = retry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(RETRY_DELAY) => {
                    let _ = retry.send(key).await;
                }
            }
        });
    }
}
