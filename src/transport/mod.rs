mod client;
mod server;

pub use client::TcpTransport;
pub use server::RpcServer;

use crate::types::ReplicaId;
use crate::wire::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use async_trait::async_trait;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("rpc deadline exceeded")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Directed RPC channel to the other replicas. Calls may block up to one
/// heartbeat period; they are always made from spawned tasks, never from the
/// replica event loop itself.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: ReplicaId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError>;

    async fn append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError>;
}
