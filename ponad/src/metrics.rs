use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("pona")));

/// Renders every registered metric in the text exposition format.
pub fn encode() -> String {
    let mut buffer = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    match prometheus_client::encoding::text::encode(&mut buffer, &registry) {
        Ok(_) => buffer,
        Err(_) => "".into(),
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CniLabels {
    pub command: String,
    pub status: String,
}

#[derive(Clone)]
pub struct CniMetrics {
    pub requests: Family<CniLabels, Counter>,
    pub duration: Histogram,
}

impl Default for CniMetrics {
    fn default() -> Self {
        Self {
            requests: Family::<CniLabels, Counter>::default(),
            duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter()),
        }
    }
}

impl CniMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "cni_duration",
            "CNI request duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "cni_requests",
            "Number of CNI requests by command and gRPC status",
            self.requests.clone(),
        );
        self
    }

    /// Counts a finished request and its duration.
    pub fn observe(&self, command: &str, status: tonic::Code, start: Instant) {
        self.requests
            .get_or_create(&CniLabels {
                command: command.to_owned(),
                status: format!("{status:?}"),
            })
            .inc();
        self.duration.observe(start.elapsed().as_secs_f64());
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: String,
}

#[derive(Clone, Default)]
pub struct TrackerMetrics {
    pub reconciles: Family<ReconcileLabels, Counter>,
}

impl TrackerMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "tracker_reconciles",
            "Number of pod tracker reconciliations",
            self.reconciles.clone(),
        );
        self
    }

    pub fn record(&self, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.reconciles
            .get_or_create(&ReconcileLabels {
                result: result.into(),
            })
            .inc();
    }
}

/// Runs `register` against the global registry.
pub fn register<T>(register: impl FnOnce(&mut Registry) -> T) -> T {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    register(&mut registry)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tracker_metrics_are_encoded() {
        let metrics = register(|r| TrackerMetrics::default().register(r));
        metrics.record(true);
        metrics.record(false);
        metrics.record(true);
        let text = encode();
        assert!(text.contains("pona_tracker_reconciles_total{result=\"success\"} 2"));
        assert!(text.contains("pona_tracker_reconciles_total{result=\"failure\"} 1"));
    }
}
