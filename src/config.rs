use crate::types::ReplicaId;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cluster member list is empty")]
    NoMembers,
    #[error("listen address {0:?} is not in the cluster member list")]
    NotAMember(String),
    #[error("duplicate cluster member address {0:?}")]
    DuplicateMember(String),
    #[error("{0}")]
    InvalidTiming(&'static str),
}

/// Consensus timing knobs. The defaults follow the reference values: the
/// election timeout is drawn uniformly from 100-200 ms and heartbeats go out
/// every 50 ms.
#[derive(Clone, Debug)]
pub struct TimingOptions {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for TimingOptions {
    fn default() -> Self {
        TimingOptions {
            election_timeout_min: Duration::from_millis(100),
            election_timeout_max: Duration::from_millis(200),
            heartbeat_interval: Duration::from_millis(50),
        }
    }
}

impl TimingOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min.is_zero() {
            return Err(ConfigError::InvalidTiming(
                "election timeout minimum must be non-zero",
            ));
        }
        if self.election_timeout_max < self.election_timeout_min * 2 {
            return Err(ConfigError::InvalidTiming(
                "election timeout maximum must be at least twice the minimum",
            ));
        }
        if self.heartbeat_interval * 2 > self.election_timeout_min {
            return Err(ConfigError::InvalidTiming(
                "heartbeat interval must be at most half the election timeout minimum",
            ));
        }
        Ok(())
    }

    /// Every peer RPC is bounded by one heartbeat period.
    pub fn rpc_timeout(&self) -> Duration {
        self.heartbeat_interval
    }
}

/// Configuration for one replica process. `members` is the full ordered
/// cluster address list, identical on every replica; a replica's id is the
/// position of its own listen address in that list.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub members: Vec<String>,
    pub data_dir: PathBuf,
    pub timing: TimingOptions,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::NoMembers);
        }
        for (i, addr) in self.members.iter().enumerate() {
            if self.members[..i].contains(addr) {
                return Err(ConfigError::DuplicateMember(addr.clone()));
            }
        }
        self.my_id()?;
        self.timing.validate()
    }

    pub fn my_id(&self) -> Result<ReplicaId, ConfigError> {
        self.members
            .iter()
            .position(|m| *m == self.listen_addr)
            .map(|i| i as ReplicaId)
            .ok_or_else(|| ConfigError::NotAMember(self.listen_addr.clone()))
    }

    /// `(id, address)` for every member other than this replica.
    pub fn peers(&self) -> Vec<(ReplicaId, String)> {
        self.members
            .iter()
            .enumerate()
            .filter(|(_, addr)| **addr != self.listen_addr)
            .map(|(i, addr)| (i as ReplicaId, addr.clone()))
            .collect()
    }
}
