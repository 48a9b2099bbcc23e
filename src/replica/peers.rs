use crate::types::ReplicaId;

/// One remote cluster member.
#[derive(Clone, Debug)]
pub struct Peer {
    pub id: ReplicaId,
    pub addr: String,
}

/// This replica's static view of the cluster: its own identity plus every
/// peer. Membership never changes at runtime, so quorum arithmetic lives
/// here.
#[derive(Clone, Debug)]
pub struct ClusterView {
    me: ReplicaId,
    my_addr: String,
    peers: Vec<Peer>,
}

impl ClusterView {
    pub fn new(me: ReplicaId, my_addr: String, peers: Vec<Peer>) -> Self {
        ClusterView { me, my_addr, peers }
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub fn my_addr(&self) -> &str {
        &self.my_addr
    }

    /// Total cluster size, self included.
    pub fn size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Strict majority test: `count` replicas out of the whole cluster.
    pub fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.size()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.peers.iter().map(|p| p.id)
    }

    pub fn addr_of(&self, id: ReplicaId) -> Option<&str> {
        if id == self.me {
            return Some(&self.my_addr);
        }
        self.peers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.addr.as_str())
    }
}
