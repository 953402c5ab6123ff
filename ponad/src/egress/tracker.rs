use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ahash::{HashMap, HashSet, HashSetExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::annotation;
use crate::metrics::TrackerMetrics;
use crate::nat::NatGateway;
use crate::tunnel::TunnelController;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl PodKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_pod(pod: &Pod) -> Self {
        Self::new(pod.namespace().unwrap_or_default(), pod.name_any())
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which pods hold which addresses, indexed both ways. A tunnel to an
/// address exists exactly while some pod references it.
#[derive(Default)]
struct State {
    pod_to_addrs: HashMap<PodKey, BTreeSet<IpAddr>>,
    addr_to_pods: HashMap<IpAddr, HashSet<PodKey>>,
}

impl State {
    /// Whether a pod other than `key` still references `addr`.
    fn referenced_by_others(&self, key: &PodKey, addr: &IpAddr) -> Result<bool> {
        let Some(pods) = self.addr_to_pods.get(addr) else {
            return Err(Error::InvariantViolation(format!(
                "{addr} recorded for {key} has no reverse entry"
            )));
        };
        if !pods.contains(key) {
            return Err(Error::InvariantViolation(format!(
                "reverse entry of {addr} does not contain {key}"
            )));
        }
        Ok(pods.len() > 1)
    }

    /// Records that `key` holds `addr`, in both indexes.
    fn link(&mut self, key: &PodKey, addr: IpAddr) {
        self.pod_to_addrs
            .entry(key.clone())
            .or_default()
            .insert(addr);
        self.addr_to_pods
            .entry(addr)
            .or_insert_with(HashSet::new)
            .insert(key.clone());
    }

    /// Drops `addr` from `key`, in both indexes.
    fn unlink(&mut self, key: &PodKey, addr: &IpAddr) {
        if let Some(pods) = self.addr_to_pods.get_mut(addr) {
            pods.remove(key);
            if pods.is_empty() {
                self.addr_to_pods.remove(addr);
            }
        }
        if let Some(addrs) = self.pod_to_addrs.get_mut(key) {
            addrs.remove(addr);
            if addrs.is_empty() {
                self.pod_to_addrs.remove(key);
            }
        }
    }

    fn verify(&self) -> Result<()> {
        for (key, addrs) in &self.pod_to_addrs {
            for addr in addrs {
                if !self
                    .addr_to_pods
                    .get(addr)
                    .is_some_and(|pods| pods.contains(key))
                {
                    return Err(Error::InvariantViolation(format!(
                        "{key} holds {addr} without a back reference"
                    )));
                }
            }
        }
        for (addr, pods) in &self.addr_to_pods {
            if pods.is_empty() {
                return Err(Error::InvariantViolation(format!(
                    "empty reverse entry for {addr}"
                )));
            }
            for key in pods {
                if !self
                    .pod_to_addrs
                    .get(key)
                    .is_some_and(|addrs| addrs.contains(addr))
                {
                    return Err(Error::InvariantViolation(format!(
                        "{addr} points at {key} which does not hold it"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn is_terminated(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn pod_addrs(pod: &Pod) -> Result<BTreeSet<IpAddr>> {
    let mut addrs = BTreeSet::new();
    let Some(status) = pod.status.as_ref() else {
        return Ok(addrs);
    };
    if let Some(pod_ips) = status.pod_ips.as_ref() {
        for pod_ip in pod_ips {
            addrs.insert(pod_ip.ip.parse()?);
        }
    } else if let Some(ip) = status.pod_ip.as_ref() {
        addrs.insert(ip.parse()?);
    }
    Ok(addrs)
}

/// Keeps one tunnel per client pod address on an egress gateway.
///
/// All transitions run under one lock that is held across the kernel calls,
/// so the maps and the kernel never disagree between reconciles.
pub struct PodTracker {
    egress_name: String,
    egress_namespace: String,
    tunnel: Arc<dyn TunnelController>,
    gateway: Arc<dyn NatGateway>,
    state: Mutex<State>,
    metrics: Option<TrackerMetrics>,
}

impl PodTracker {
    pub fn new(
        egress_name: impl Into<String>,
        egress_namespace: impl Into<String>,
        tunnel: Arc<dyn TunnelController>,
        gateway: Arc<dyn NatGateway>,
    ) -> Self {
        Self {
            egress_name: egress_name.into(),
            egress_namespace: egress_namespace.into(),
            tunnel,
            gateway,
            state: Mutex::new(State::default()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: TrackerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn should_handle(&self, pod: &Pod) -> bool {
        !annotation::is_host_network(pod)
            && annotation::references(pod, &self.egress_namespace, &self.egress_name)
    }

    /// Brings the tunnels for `key` in line with `pod`, the pod's current
    /// state or `None` when it no longer exists.
    #[tracing::instrument(skip_all, fields(pod = %key))]
    pub async fn reconcile(&self, key: &PodKey, pod: Option<&Pod>) -> Result<()> {
        let mut res = match pod {
            None => self.handle_deletion(key).await,
            Some(pod) if !self.should_handle(pod) => {
                // the annotation may have been removed after we started tracking
                if self.state.lock().await.pod_to_addrs.contains_key(key) {
                    self.handle_deletion(key).await
                } else {
                    Ok(())
                }
            }
            Some(pod) if is_terminated(pod) => self.handle_deletion(key).await,
            Some(pod) => self.handle_running(key, pod).await,
        };
        if res.is_ok() {
            res = self.verify().await;
        }
        if let Some(metrics) = &self.metrics {
            metrics.record(res.is_ok());
        }
        res
    }

    // An address enters or leaves both indexes right after its own kernel
    // change succeeds.
    async fn handle_running(&self, key: &PodKey, pod: &Pod) -> Result<()> {
        let mut state = self.state.lock().await;
        let observed = pod_addrs(pod)?;
        let existing = state.pod_to_addrs.get(key).cloned().unwrap_or_default();

        for addr in observed.difference(&existing) {
            let link = match self.tunnel.add_peer(*addr).await {
                Ok(link) => link,
                Err(Error::IpFamilyMismatch(_)) => {
                    info!(%addr, "skipping pod address of unsupported family");
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.gateway.add_client(*addr, &link).await?;
            state.link(key, *addr);
        }

        for addr in existing.difference(&observed) {
            if state.referenced_by_others(key, addr)? {
                debug!(%addr, "address still used by another pod");
            } else {
                self.tunnel.del_peer(*addr).await?;
                info!(%addr, "tunnel deleted");
            }
            state.unlink(key, addr);
        }
        Ok(())
    }

    async fn handle_deletion(&self, key: &PodKey) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(addrs) = state.pod_to_addrs.get(key).cloned() else {
            return Ok(());
        };
        for addr in &addrs {
            if !state.referenced_by_others(key, addr)? {
                self.tunnel.del_peer(*addr).await?;
                info!(%addr, "tunnel deleted");
            }
            state.unlink(key, addr);
        }
        Ok(())
    }

    /// Checks that both indexes agree with each other.
    pub async fn verify(&self) -> Result<()> {
        self.state.lock().await.verify()
    }

    /// Addresses currently held by `key`.
    pub async fn addrs(&self, key: &PodKey) -> Vec<IpAddr> {
        self.state
            .lock()
            .await
            .pod_to_addrs
            .get(key)
            .map(|addrs| addrs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pods currently holding at least one address.
    pub async fn tracked(&self) -> Vec<PodKey> {
        self.state.lock().await.pod_to_addrs.keys().cloned().collect()
    }

    /// Number of distinct addresses with a tunnel.
    pub async fn tunnel_count(&self) -> usize {
        self.state.lock().await.addr_to_pods.len()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{PodIP, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::nat::memory::MemoryGateway;
    use crate::tunnel::memory::MemoryTunnel;

    const EGRESS: &str = "egress";
    const EGRESS_NS: &str = "default";

    fn pod(name: &str, ips: &[&str]) -> Pod {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            format!("egress.pona.cybozu.com/{EGRESS_NS}"),
            EGRESS.to_owned(),
        );
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("app".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec::default()),
            status: Some(PodStatus {
                phase: Some("Running".into()),
                pod_ips: Some(
                    ips.iter()
                        .map(|ip| PodIP {
                            ip: ip.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
        }
    }

    fn tracker() -> (PodTracker, Arc<MemoryTunnel>, Arc<MemoryGateway>) {
        let tunnel = Arc::new(MemoryTunnel::new(true, false));
        let gateway = Arc::new(MemoryGateway::new(true, false));
        let tracker = PodTracker::new(EGRESS, EGRESS_NS, tunnel.clone(), gateway.clone());
        (tracker, tunnel, gateway)
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_running_pod_gets_tunnel() -> Result<()> {
        let (tracker, tunnel, gateway) = tracker();
        let p = pod("a", &["192.168.0.1"]);
        let key = PodKey::from_pod(&p);

        tracker.reconcile(&key, Some(&p)).await?;
        tracker.verify().await?;
        assert_eq!(tunnel.peers(), vec![addr("192.168.0.1")]);
        assert_eq!(gateway.clients(), vec![addr("192.168.0.1")]);

        // a second reconcile of the same state does nothing
        tracker.reconcile(&key, Some(&p)).await?;
        assert_eq!(tunnel.counts(), (1, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_address_change_replaces_tunnel() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let key = PodKey::new("app", "a");

        tracker
            .reconcile(&key, Some(&pod("a", &["192.168.0.1"])))
            .await?;
        tracker
            .reconcile(&key, Some(&pod("a", &["192.168.0.2"])))
            .await?;
        tracker.verify().await?;
        assert_eq!(tunnel.peers(), vec![addr("192.168.0.2")]);
        assert_eq!(tracker.addrs(&key).await, vec![addr("192.168.0.2")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unsupported_family_is_skipped() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let p = pod("a", &["192.168.0.1", "fd00::1"]);
        let key = PodKey::from_pod(&p);

        tracker.reconcile(&key, Some(&p)).await?;
        tracker.verify().await?;
        assert_eq!(tunnel.peers(), vec![addr("192.168.0.1")]);
        assert_eq!(tracker.addrs(&key).await, vec![addr("192.168.0.1")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_address_is_reference_counted() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let p1 = pod("p1", &["192.168.0.1"]);
        let p2 = pod("p2", &["192.168.0.1"]);
        let k1 = PodKey::from_pod(&p1);
        let k2 = PodKey::from_pod(&p2);

        tracker.reconcile(&k1, Some(&p1)).await?;
        tracker.reconcile(&k2, Some(&p2)).await?;
        assert_eq!(tunnel.counts(), (1, 0));

        tracker.reconcile(&k1, None).await?;
        tracker.verify().await?;
        assert!(tunnel.has_peer(addr("192.168.0.1")));

        tracker.reconcile(&k2, None).await?;
        tracker.verify().await?;
        assert!(!tunnel.has_peer(addr("192.168.0.1")));
        assert_eq!(tracker.tunnel_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_terminated_pod_is_released() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let mut p = pod("a", &["192.168.0.1"]);
        let key = PodKey::from_pod(&p);
        tracker.reconcile(&key, Some(&p)).await?;

        p.metadata.deletion_timestamp = Some(Time(Default::default()));
        tracker.reconcile(&key, Some(&p)).await?;
        tracker.verify().await?;
        assert!(tunnel.peers().is_empty());

        let mut done = pod("b", &["192.168.0.3"]);
        let key = PodKey::from_pod(&done);
        tracker.reconcile(&key, Some(&done)).await?;
        if let Some(status) = done.status.as_mut() {
            status.phase = Some("Succeeded".into());
        }
        tracker.reconcile(&key, Some(&done)).await?;
        assert!(tunnel.peers().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_unrelated_pods_are_ignored() -> Result<()> {
        let (tracker, tunnel, _) = tracker();

        let mut other = pod("a", &["192.168.0.1"]);
        other.metadata.annotations = Some(BTreeMap::from([(
            "egress.pona.cybozu.com/default".to_owned(),
            "another".to_owned(),
        )]));
        tracker
            .reconcile(&PodKey::from_pod(&other), Some(&other))
            .await?;

        let mut host = pod("b", &["192.168.0.2"]);
        host.spec = Some(PodSpec {
            host_network: Some(true),
            ..Default::default()
        });
        tracker
            .reconcile(&PodKey::from_pod(&host), Some(&host))
            .await?;

        assert!(tunnel.peers().is_empty());
        assert_eq!(tracker.tunnel_count().await, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_invariant_holds_over_event_sequence() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let steps: Vec<(&str, Option<Vec<&str>>)> = vec![
            ("a", Some(vec!["192.168.0.1"])),
            ("b", Some(vec!["192.168.0.2"])),
            ("c", Some(vec!["192.168.0.1"])),
            ("a", Some(vec!["192.168.0.3"])),
            ("b", None),
            ("c", None),
            ("a", Some(vec![])),
            ("d", Some(vec!["192.168.0.3"])),
            ("a", None),
        ];
        for (name, ips) in steps {
            let key = PodKey::new("app", name);
            match ips {
                Some(ips) => tracker.reconcile(&key, Some(&pod(name, &ips))).await?,
                None => tracker.reconcile(&key, None).await?,
            }
            tracker.verify().await?;
            let state = tracker.state.lock().await;
            let mut tracked: Vec<IpAddr> = state.addr_to_pods.keys().copied().collect();
            tracked.sort();
            assert_eq!(tunnel.peers(), tracked);
        }
        assert_eq!(tunnel.peers(), vec![addr("192.168.0.3")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_delete_is_retried() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let p = pod("a", &["10.0.0.1", "10.0.0.2"]);
        let key = PodKey::from_pod(&p);
        tracker.reconcile(&key, Some(&p)).await?;

        tunnel.fail_del_once(addr("10.0.0.2"));
        assert!(tracker.reconcile(&key, None).await.is_err());
        tracker.verify().await?;
        assert_eq!(tracker.addrs(&key).await, vec![addr("10.0.0.2")]);
        assert_eq!(tunnel.peers(), vec![addr("10.0.0.2")]);

        tracker.reconcile(&key, None).await?;
        assert!(tunnel.peers().is_empty());
        assert!(tracker.tracked().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_stale_delete_is_retried() -> Result<()> {
        let (tracker, tunnel, _) = tracker();
        let key = PodKey::new("app", "a");
        tracker
            .reconcile(&key, Some(&pod("a", &["10.0.0.1", "10.0.0.2"])))
            .await?;

        let moved = pod("a", &["10.0.0.3"]);
        tunnel.fail_del_once(addr("10.0.0.2"));
        assert!(tracker.reconcile(&key, Some(&moved)).await.is_err());
        tracker.verify().await?;
        assert_eq!(
            tracker.addrs(&key).await,
            vec![addr("10.0.0.2"), addr("10.0.0.3")]
        );

        tracker.reconcile(&key, Some(&moved)).await?;
        assert_eq!(tunnel.peers(), vec![addr("10.0.0.3")]);
        assert_eq!(tracker.addrs(&key).await, vec![addr("10.0.0.3")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_state_fails_loudly() {
        let (tracker, _, _) = tracker();
        let key = PodKey::new("app", "a");
        tracker
            .state
            .lock()
            .await
            .pod_to_addrs
            .insert(key.clone(), BTreeSet::from([addr("192.168.0.1")]));

        assert!(matches!(
            tracker.verify().await,
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            tracker.reconcile(&key, None).await,
            Err(Error::InvariantViolation(_))
        ));
    }
}
