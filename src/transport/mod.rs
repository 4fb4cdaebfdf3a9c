//! Shard transport seam
//!
//! The router is transport-agnostic: everything it sends goes through
//! [`ShardTransport`], one command to one shard, resolved to the shard's
//! reply document or a transport failure. Fan-outs use [`scatter_gather`],
//! which preserves request order so callers can apply the
//! first-error-or-last-response rule deterministically.

use crate::cluster::ShardId;
use crate::error::Result;
use crate::protocol::{ShardCommand, ShardResponse};
use async_trait::async_trait;
use futures_util::future::join_all;

/// Dispatches a single command to a single shard.
///
/// Implementations own connection pooling, retry of transport-level
/// hiccups, and the caller's deadline. A returned `Err` means no usable
/// reply was obtained; a `ShardResponse` may still describe a command
/// failure (`ok: 0`).
#[async_trait]
pub trait ShardTransport: Send + Sync {
    async fn send_command(&self, shard: &ShardId, command: ShardCommand) -> Result<ShardResponse>;
}

/// Dispatch a batch of per-shard requests and gather every outcome.
///
/// Results come back in the order of `requests`, not completion order.
pub async fn scatter_gather(
    transport: &dyn ShardTransport,
    requests: Vec<(ShardId, ShardCommand)>,
) -> Vec<(ShardId, Result<ShardResponse>)> {
    let sends = requests.into_iter().map(|(shard, command)| async move {
        let response = transport.send_command(&shard, command).await;
        (shard, response)
    });
    join_all(sends).await
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::*;
    use crate::error::ErrorCode;

    #[tokio::test]
    async fn scatter_gather_preserves_request_order() {
        let transport = ScriptedTransport::new();
        let a = ShardId::new("shard-a");
        let b = ShardId::new("shard-b");
        let c = ShardId::new("shard-c");
        transport.enqueue(
            &b,
            Ok(ShardResponse::error(
                ErrorCode::NoSuchTransaction.as_i32(),
                "not here",
            )),
        );

        let requests = [&a, &b, &c]
            .into_iter()
            .map(|shard| (shard.clone(), ShardCommand::new("abortTransaction")))
            .collect();
        let results = scatter_gather(&transport, requests).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, a);
        assert_eq!(results[1].0, b);
        assert_eq!(results[2].0, c);
        assert!(results[0].1.as_ref().is_ok_and(ShardResponse::is_ok));
        assert!(!results[1].1.as_ref().is_ok_and(ShardResponse::is_ok));
    }
}
