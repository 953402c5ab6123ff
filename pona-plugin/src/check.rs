use tracing::{error, info};

use crate::client::{block_on, connect, make_cni_args, request};
use crate::config::Args;
use crate::response::Response;
use crate::types::Input;

pub fn check(args: &Args, input: Input, stdin: Vec<u8>) -> Response {
    info!(container = %args.container_id, "check called");
    let req = make_cni_args(args, stdin);
    let res = block_on(async {
        let mut client = connect(&input.socket).await?;
        client.check(request(req)).await?;
        Ok::<_, crate::Error>(())
    })
    .and_then(|r| r);
    match res {
        Ok(()) => Response::Empty,
        Err(e) => {
            error!(%e, "check request to ponad failed");
            e.into_response(input.cni_version)
        }
    }
}
