use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use http::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::http::shutdown;

/// Readiness flips once `ready` is cancelled by whoever finishes startup.
#[derive(Clone)]
pub struct State {
    ready: CancellationToken,
}

impl State {
    pub fn new(ready: CancellationToken) -> Self {
        Self { ready }
    }

    fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub async fn serve(addr: SocketAddr, state: Arc<State>, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .with_state(state)
}

async fn metrics() -> String {
    crate::metrics::encode()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        match self {
            Readiness::Ready => (StatusCode::OK, "Ok").into_response(),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady").into_response(),
        }
    }
}
