use tracing::{error, info};

use crate::client::{block_on, connect, make_cni_args, request};
use crate::config::Args;
use crate::response::Response;
use crate::types::Input;
use crate::{Error, Result};

pub fn add(args: &Args, input: Input, stdin: Vec<u8>) -> Response {
    info!(
        container = %args.container_id,
        netns = %args.net_ns,
        "add called for network {}",
        input.name
    );
    let Some(prev) = input.previous_result.as_deref() else {
        return Error::NoPreviousResult("pona must be chained after an ipam plugin".into())
            .into_response(input.cni_version);
    };

    let req = make_cni_args(args, stdin);
    let result = match block_on(call(&input.socket, req)).and_then(|r| r) {
        Ok(result) => result,
        Err(e) => {
            error!(%e, "add request to ponad failed");
            return e.into_response(input.cni_version);
        }
    };

    // an empty result means ponad changed nothing and the previous result stands
    if result.is_empty() {
        info!("no egress configured, passing previous result through");
        return Response::Result(prev.get().as_bytes().to_vec());
    }
    Response::Result(result)
}

async fn call(socket: &str, req: pona_api::cni::v1::CniArgs) -> Result<Vec<u8>> {
    let mut client = connect(socket).await?;
    let resp = client.add(request(req)).await?;
    Ok(resp.into_inner().result)
}
