use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Spawns a reflector for `api` and waits for the initial list to land in the
/// returned store. `timeout` bounds the wait; `None` waits forever.
pub async fn create_store<K>(
    api: Api<K>,
    config: watcher::Config,
    timeout: Option<Duration>,
) -> Result<Store<K>>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + Sync + Hash + Clone,
{
    let (store, writer) = reflector::store();

    let stream = watcher(api, config)
        .default_backoff()
        .reflect(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
        });
    tokio::spawn(stream);

    let wait = store.wait_until_ready();
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
            .map_err(|e| Error::StoreCreation(e.to_string()))?,
        None => wait
            .await
            .map_err(|e| Error::StoreCreation(e.to_string()))?,
    }
    Ok(store)
}

/// Field selector restricting a pod watch to a single node.
pub fn node_pod_selector(node_name: &str) -> watcher::Config {
    watcher::Config::default().fields(&format!("spec.nodeName={node_name}"))
}
