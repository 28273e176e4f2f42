//! Stream-multiplexed RPC fabric and NFSv3 mount bridge for agent-backed
//! backups. See `DESIGN.md` for the grounding ledger behind each module.

pub mod agentfs;
pub mod broker;
pub mod codec;
pub mod config;
pub mod dirreader;
pub mod error;
pub mod handle_table;
pub mod handshake;
pub mod logging;
pub mod mode;
pub mod mount;
pub mod router;
pub mod session;
pub mod sparse;
pub mod transport;

use std::sync::Arc;

use router::{HandlerReply, Router};

/// Registers the two reserved top-level verbs every session accepts
/// outside any job namespace (spec §6, "Reserved top-level verbs: `echo`,
/// `ping`").
pub async fn register_reserved_verbs(router: &Router) {
    router
        .register(
            "echo",
            Arc::new(|req| Box::pin(async move { Ok(HandlerReply::Struct(req.payload)) })),
        )
        .await;
    router
        .register("ping", Arc::new(|_req| Box::pin(async { Ok(HandlerReply::Struct(Vec::new())) })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Request;

    #[tokio::test]
    async fn reserved_verbs_are_registered() {
        let router = Router::new();
        register_reserved_verbs(&router).await;
        assert_eq!(router.method_count().await, 2);

        match router.dispatch(Request::new("echo", vec![1, 2, 3])).await {
            router::DispatchOutcome::Respond(resp) => assert_eq!(resp.data, vec![1, 2, 3]),
            _ => panic!("expected Respond"),
        }
        match router.dispatch(Request::new("ping", vec![])).await {
            router::DispatchOutcome::Respond(resp) => assert_eq!(resp.status, 200),
            _ => panic!("expected Respond"),
        }
    }
}
