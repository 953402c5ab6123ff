use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use pona_api::cni::v1::CniArgs;
use pona_api::cni::v1::cni_client::CniClient;
use pona_api::{POD_CONTAINER_KEY, POD_NAME_KEY, POD_NAMESPACE_KEY};
use tokio::net::UnixStream;
use tonic::Request;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use crate::Result;
use crate::config::Args;

/// Upper bound on a whole call to ponad.
pub const TIMEOUT: Duration = Duration::from_secs(60);

pub async fn connect(socket: &str) -> Result<CniClient<Channel>> {
    let path = PathBuf::from(socket);
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_timeout(TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await?;
    Ok(CniClient::new(channel))
}

/// Wraps `args` in a request carrying [`TIMEOUT`] as its gRPC deadline.
pub fn request(args: CniArgs) -> Request<CniArgs> {
    let mut request = Request::new(args);
    request.set_timeout(TIMEOUT);
    request
}

pub fn make_cni_args(args: &Args, stdin: Vec<u8>) -> CniArgs {
    let forwarded: HashMap<String, String> = [POD_NAMESPACE_KEY, POD_NAME_KEY, POD_CONTAINER_KEY]
        .into_iter()
        .map(|key| {
            let value = args.args.get(key).cloned().unwrap_or_default();
            (key.to_owned(), value)
        })
        .collect();
    CniArgs {
        container_id: args.container_id.clone(),
        netns: args.net_ns.clone(),
        ifname: args.ifname.clone(),
        args: forwarded,
        path: args.paths.clone(),
        stdin_data: stdin,
    }
}

/// Runs `fut` to completion on a fresh single threaded runtime.
pub fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(fut))
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_make_cni_args_forwards_pod_keys() {
        let args = Args::try_parse_from([
            "pona",
            "--command",
            "ADD",
            "--container-id",
            "c0ffee",
            "--net-ns",
            "/var/run/netns/cni-1",
            "--ifname",
            "eth0",
            "--args",
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=app;K8S_POD_NAME=client",
            "--paths",
            "/opt/cni/bin",
        ])
        .unwrap();
        let cni = make_cni_args(&args, b"{}".to_vec());
        assert_eq!(cni.container_id, "c0ffee");
        assert_eq!(cni.netns, "/var/run/netns/cni-1");
        assert_eq!(cni.args.get(POD_NAMESPACE_KEY).map(String::as_str), Some("app"));
        assert_eq!(cni.args.get(POD_NAME_KEY).map(String::as_str), Some("client"));
        assert_eq!(cni.args.get(POD_CONTAINER_KEY).map(String::as_str), Some(""));
        assert!(!cni.args.contains_key("IgnoreUnknown"));
        assert_eq!(cni.stdin_data, b"{}");
    }

    #[test]
    fn test_request_carries_deadline() {
        let req = request(CniArgs::default());
        assert!(req.metadata().get("grpc-timeout").is_some());
    }

    #[test]
    fn test_connect_missing_socket_fails() {
        let res = block_on(connect("/nonexistent/ponad.sock")).unwrap();
        assert!(res.is_err());
    }
}
