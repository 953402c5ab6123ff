mod metrics;

pub use metrics::{State, router, serve};

use tokio_util::sync::CancellationToken;

pub(crate) async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await
}
