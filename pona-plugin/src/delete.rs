use tracing::{info, warn};

use crate::client::{block_on, connect, make_cni_args, request};
use crate::config::Args;
use crate::response::Response;
use crate::types::Input;

// DEL must not fail pod teardown: ponad cleans up from the pod lifecycle,
// so an unreachable daemon is only logged.
pub fn delete(args: &Args, input: Input, stdin: Vec<u8>) -> Response {
    info!(container = %args.container_id, "delete called");
    let req = make_cni_args(args, stdin);
    let res = block_on(async {
        let mut client = connect(&input.socket).await?;
        client.del(request(req)).await?;
        Ok::<_, crate::Error>(())
    })
    .and_then(|r| r);
    if let Err(e) = res {
        warn!(%e, "del request to ponad failed");
    }
    Response::Empty
}
