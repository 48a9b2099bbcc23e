use crate::actor::ActorClient;
use crate::config::TimingOptions;
use crate::replica::peers::ClusterView;
use crate::replica::timers::{FollowerTimerHandle, LeaderTimerHandle};
use crate::types::{LogIndex, ReplicaId, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

/// The replica's role state machine. Each role owns exactly the volatile
/// state that only makes sense in that role: followers track who leads and a
/// timeout, candidates tally votes under their election's term, leaders keep
/// per-peer replication progress and heartbeat timers. Transitioning drops
/// the previous role's timers, which cancels their background tasks.
pub struct ElectionState {
    state: State,
    timing: TimingOptions,
    actor_client: ActorClient,
}

enum State {
    Follower(FollowerState),
    Candidate(CandidateState),
    Leader(LeaderState),
    Dead,
}

struct FollowerState {
    leader_id: Option<ReplicaId>,
    timer: FollowerTimerHandle,
}

struct CandidateState {
    term: Term,
    votes: HashSet<ReplicaId>,
    // Kept alive so the candidate re-campaigns if this election stalls.
    _timer: FollowerTimerHandle,
}

struct LeaderState {
    term: Term,
    next_index: HashMap<ReplicaId, LogIndex>,
    match_index: HashMap<ReplicaId, LogIndex>,
    _heartbeats: Vec<LeaderTimerHandle>,
}

impl ElectionState {
    pub fn new_follower(timing: TimingOptions, actor_client: ActorClient) -> Self {
        let timer = FollowerTimerHandle::spawn(
            timing.election_timeout_min,
            timing.election_timeout_max,
            actor_client.clone(),
        );
        ElectionState {
            state: State::Follower(FollowerState {
                leader_id: None,
                timer,
            }),
            timing,
            actor_client,
        }
    }

    pub fn role(&self) -> Role {
        match self.state {
            State::Follower(_) => Role::Follower,
            State::Candidate(_) => Role::Candidate,
            State::Leader(_) => Role::Leader,
            State::Dead => Role::Dead,
        }
    }

    /// Which replica we believe leads right now, if any.
    pub fn known_leader(&self, me: ReplicaId) -> Option<ReplicaId> {
        match &self.state {
            State::Leader(_) => Some(me),
            State::Follower(fs) => fs.leader_id,
            State::Candidate(_) | State::Dead => None,
        }
    }

    pub fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.timer.reset_timeout();
        }
    }

    /// Remembers who is leading the current term. Only meaningful while
    /// following.
    pub fn record_leader(&mut self, leader_id: ReplicaId) {
        if let State::Follower(fs) = &mut self.state {
            fs.leader_id = Some(leader_id);
        }
    }

    pub fn transition_to_follower(&mut self, leader_id: Option<ReplicaId>) {
        if let State::Dead = self.state {
            return;
        }
        self.state = State::Follower(FollowerState {
            leader_id,
            timer: self.spawn_follower_timer(),
        });
    }

    /// Starts an election at `term` with our own vote already counted.
    pub fn transition_to_candidate(&mut self, term: Term, me: ReplicaId) {
        let mut votes = HashSet::new();
        votes.insert(me);
        self.state = State::Candidate(CandidateState {
            term,
            votes,
            _timer: self.spawn_follower_timer(),
        });
    }

    pub fn is_candidate_for(&self, term: Term) -> bool {
        matches!(&self.state, State::Candidate(cs) if cs.term == term)
    }

    /// Counts a granted vote and returns the tally. Stale-term and
    /// wrong-role replies fall out as a zero tally.
    pub fn add_vote(&mut self, term: Term, from: ReplicaId) -> usize {
        if let State::Candidate(cs) = &mut self.state {
            if cs.term == term {
                cs.votes.insert(from);
                return cs.votes.len();
            }
        }
        0
    }

    /// Takes office for `term`: initializes per-peer replication state
    /// (`next_index` one past our last entry, `match_index` unknown) and
    /// spawns a heartbeat timer per peer, each tagged with the term so stale
    /// ticks are discarded after a step-down.
    pub fn transition_to_leader(
        &mut self,
        term: Term,
        cluster: &ClusterView,
        next_index_init: LogIndex,
    ) {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        let mut heartbeats = Vec::with_capacity(cluster.peers().len());
        for peer_id in cluster.peer_ids() {
            next_index.insert(peer_id, next_index_init);
            match_index.insert(peer_id, -1);
            heartbeats.push(LeaderTimerHandle::spawn(
                self.timing.heartbeat_interval,
                self.actor_client.clone(),
                peer_id,
                term,
            ));
        }

        self.state = State::Leader(LeaderState {
            term,
            next_index,
            match_index,
            _heartbeats: heartbeats,
        });
    }

    pub fn transition_to_dead(&mut self) {
        self.state = State::Dead;
    }

    pub fn leader_term(&self) -> Option<Term> {
        match &self.state {
            State::Leader(ls) => Some(ls.term),
            _ => None,
        }
    }

    pub fn next_index(&self, peer: ReplicaId) -> Option<LogIndex> {
        match &self.state {
            State::Leader(ls) => ls.next_index.get(&peer).copied(),
            _ => None,
        }
    }

    /// Records a successful replication up to `match_index` for `peer`.
    pub fn record_replicated(&mut self, peer: ReplicaId, match_index: LogIndex) {
        if let State::Leader(ls) = &mut self.state {
            ls.match_index.insert(peer, match_index);
            ls.next_index.insert(peer, match_index + 1);
        }
    }

    /// Backs off `next_index` after a consistency-check rejection, floored
    /// at the start of the log.
    pub fn decrement_next_index(&mut self, peer: ReplicaId) {
        if let State::Leader(ls) = &mut self.state {
            if let Some(next) = ls.next_index.get_mut(&peer) {
                *next = (*next - 1).max(0);
            }
        }
    }

    /// How many replicas (self included) are known to hold index `n`.
    pub fn replicated_count(&self, n: LogIndex) -> usize {
        match &self.state {
            State::Leader(ls) => {
                1 + ls.match_index.values().filter(|m| **m >= n).count()
            }
            _ => 0,
        }
    }

    fn spawn_follower_timer(&self) -> FollowerTimerHandle {
        FollowerTimerHandle::spawn(
            self.timing.election_timeout_min,
            self.timing.election_timeout_max,
            self.actor_client.clone(),
        )
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(ls) => write!(f, "Leader(term={})", ls.term),
            State::Candidate(cs) => write!(f, "Candidate(term={}, votes={})", cs.term, cs.votes.len()),
            State::Follower(FollowerState {
                leader_id: Some(id), ..
            }) => write!(f, "Follower(leader={})", id),
            State::Follower(_) => write!(f, "Follower(leader=?)"),
            State::Dead => write!(f, "Dead"),
        }
    }
}
