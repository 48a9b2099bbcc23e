mod actor;
mod apply;
mod client;
mod cmdlog;
mod config;
mod gateway;
mod node;
mod replica;
mod storage;
mod store;
mod transport;
mod types;
mod wire;

pub use actor::FatalError;
pub use apply::StoreHandle;
pub use client::ClientError;
pub use client::DataClient;
pub use cmdlog::ApplyOutcome;
pub use cmdlog::Command;
pub use cmdlog::CommandLog;
pub use cmdlog::LogEntry;
pub use config::ConfigError;
pub use config::NodeConfig;
pub use config::TimingOptions;
pub use node::Node;
pub use node::StartError;
pub use replica::NodeStatus;
pub use replica::Peer;
pub use replica::Role;
pub use storage::FileStorage;
pub use storage::MemoryStorage;
pub use storage::Storage;
pub use store::Album;
pub use store::AlbumStore;
pub use store::StoreError;
pub use transport::PeerTransport;
pub use transport::TcpTransport;
pub use transport::TransportError;
pub use types::LogIndex;
pub use types::ReplicaId;
pub use types::Term;
pub use wire::method;
pub use wire::AppendEntriesArgs;
pub use wire::AppendEntriesReply;
pub use wire::DataMessage;
pub use wire::RequestVoteArgs;
pub use wire::RequestVoteReply;
