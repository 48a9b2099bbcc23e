mod election;
mod peers;
mod replica;
mod timers;

pub use election::Role;
pub use peers::{ClusterView, Peer};
pub use replica::{NodeStatus, Replica, ReplicaConfig, SubmitError, WriteReceipt};
