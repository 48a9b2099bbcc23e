//! Per-replica consensus state and the handlers behind the event loop.
//!
//! The algorithm follows the Raft paper ("In Search of an Understandable
//! Consensus Algorithm", Ongaro & Ousterhout); paper-quote comments mark the
//! rule a given block implements. Handlers run on the replica actor, one at
//! a time, and never perform network I/O themselves: RPC fan-out happens in
//! spawned tasks that come back as reply events tagged with the term they
//! were sent under, so anything stale is discarded by a term check on
//! arrival.

use crate::actor::ActorClient;
use crate::apply::CommitNotice;
use crate::cmdlog::{Command, CommandLog, LogEntry};
use crate::config::TimingOptions;
use crate::replica::election::{ElectionState, Role};
use crate::replica::peers::ClusterView;
use crate::storage::{DurableState, Storage};
use crate::transport::{PeerTransport, TransportError};
use crate::types::{LogIndex, ReplicaId, Term};
use crate::wire::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use std::io;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Where a submitted write landed in the log. The gateway matches the apply
/// notification against exactly this `(index, term)` pair.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WriteReceipt {
    pub index: LogIndex,
    pub term: Term,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("this replica is not the leader")]
    NotLeader { hint: Option<String> },
    #[error("replica is shutting down")]
    Shutdown,
}

/// Snapshot of the replica's externally visible consensus position,
/// published through a watch channel on every change.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub role: Role,
    pub term: Term,
    pub leader_addr: Option<String>,
}

pub struct ReplicaConfig<S: Storage, T: PeerTransport> {
    pub logger: slog::Logger,
    pub cluster: ClusterView,
    pub storage: S,
    pub transport: Arc<T>,
    pub timing: TimingOptions,
    pub actor_client: ActorClient,
    pub durable: DurableState,
    pub apply_tx: mpsc::UnboundedSender<CommitNotice>,
    pub status_tx: watch::Sender<NodeStatus>,
}

pub struct Replica<S: Storage, T: PeerTransport> {
    logger: slog::Logger,
    cluster: ClusterView,
    storage: S,
    transport: Arc<T>,
    actor_client: ActorClient,

    // Persistent state (mirrored to storage before any dependent reply).
    current_term: Term,
    voted_for: Option<ReplicaId>,
    log: CommandLog,

    // Volatile state.
    election: ElectionState,
    commit_index: LogIndex,
    /// Highest index already handed to the apply loop.
    last_dispatched: LogIndex,

    apply_tx: mpsc::UnboundedSender<CommitNotice>,
    status_tx: watch::Sender<NodeStatus>,
}

impl<S: Storage, T: PeerTransport> Replica<S, T> {
    pub fn new(config: ReplicaConfig<S, T>) -> Self {
        let election = ElectionState::new_follower(config.timing, config.actor_client.clone());
        let mut replica = Replica {
            logger: config.logger,
            cluster: config.cluster,
            storage: config.storage,
            transport: config.transport,
            actor_client: config.actor_client,
            current_term: config.durable.current_term,
            voted_for: config.durable.voted_for,
            log: CommandLog::from_entries(config.durable.entries),
            election,
            commit_index: -1,
            last_dispatched: -1,
            apply_tx: config.apply_tx,
            status_tx: config.status_tx,
        };
        slog::info!(
            replica.logger, "replica booted";
            "term" => replica.current_term,
            "log_len" => replica.log.len(),
        );
        replica.publish_status();
        replica
    }

    // ------------------------------------------------------------------
    // RequestVote, receiver side
    // ------------------------------------------------------------------

    pub fn handle_request_vote(
        &mut self,
        args: RequestVoteArgs,
    ) -> io::Result<RequestVoteReply> {
        if self.election.role() == Role::Dead {
            return Ok(self.vote_reply(false));
        }

        // > Reply false if term < currentTerm (§5.1)
        if args.term < self.current_term {
            return Ok(self.vote_reply(false));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if args.term > self.current_term {
            self.step_down(args.term, None)?;
        }

        // > If votedFor is null or candidateId, and candidate's log is at
        // > least as up-to-date as receiver's log, grant vote (§5.2, §5.4)
        let can_vote = match self.voted_for {
            None => true,
            Some(already) => already == args.candidate_id,
        };
        let granted = can_vote && self.candidate_log_is_up_to_date(&args);

        if granted {
            self.voted_for = Some(args.candidate_id);
            self.storage.save_vote(self.current_term, self.voted_for)?;
            self.election.reset_timeout_if_follower();
            slog::info!(
                self.logger, "granted vote";
                "candidate" => args.candidate_id,
                "term" => self.current_term,
            );
        }

        Ok(self.vote_reply(granted))
    }

    // > If the logs have last entries with different terms, then the log
    // > with the later term is more up-to-date. If the logs end with the
    // > same term, then whichever log is longer is more up-to-date. (§5.4.1)
    fn candidate_log_is_up_to_date(&self, args: &RequestVoteArgs) -> bool {
        args.last_log_term > self.log.last_term()
            || (args.last_log_term == self.log.last_term()
                && args.last_log_index >= self.log.last_index())
    }

    fn vote_reply(&self, vote_granted: bool) -> RequestVoteReply {
        RequestVoteReply {
            term: self.current_term,
            vote_granted,
        }
    }

    // ------------------------------------------------------------------
    // AppendEntries, receiver side
    // ------------------------------------------------------------------

    pub fn handle_append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> io::Result<AppendEntriesReply> {
        if self.election.role() == Role::Dead {
            return Ok(self.append_reply(false));
        }

        // > Reply false if term < currentTerm (§5.1)
        if args.term < self.current_term {
            return Ok(self.append_reply(false));
        }

        let role = self.election.role();
        if args.term > self.current_term || role == Role::Candidate {
            self.step_down(args.term, Some(args.leader_id))?;
        } else if role == Role::Leader {
            // Two leaders in one term would violate election safety.
            slog::error!(
                self.logger, "AppendEntries from another leader in my own term";
                "other" => args.leader_id,
                "term" => args.term,
            );
            return Ok(self.append_reply(false));
        }

        self.election.reset_timeout_if_follower();
        self.election.record_leader(args.leader_id);
        self.publish_status();

        // > Reply false if log doesn't contain an entry at prevLogIndex
        // > whose term matches prevLogTerm (§5.3)
        if args.prev_log_index >= 0
            && (args.prev_log_index > self.log.last_index()
                || self.log.term_at(args.prev_log_index) != args.prev_log_term)
        {
            return Ok(self.append_reply(false));
        }

        // > If an existing entry conflicts with a new one (same index but
        // > different terms), delete the existing entry and all that follow
        // > it (§5.3). Append any new entries not already in the log.
        let mut appended = Vec::new();
        for (k, entry) in args.entries.iter().enumerate() {
            let index = args.prev_log_index + 1 + k as LogIndex;
            if index <= self.log.last_index() {
                if self.log.term_at(index) == entry.term {
                    continue;
                }
                self.log.truncate_from(index);
                self.storage.truncate_from(index)?;
            }
            self.log.append(entry.clone());
            appended.push(entry.clone());
        }
        if !appended.is_empty() {
            self.storage.append_entries(&appended)?;
        }

        // > If leaderCommit > commitIndex,
        // > set commitIndex = min(leaderCommit, index of last new entry)
        if args.leader_commit > self.commit_index {
            self.commit_index = args.leader_commit.min(self.log.last_index());
            self.dispatch_apply_notices();
        }

        Ok(self.append_reply(true))
    }

    fn append_reply(&self, success: bool) -> AppendEntriesReply {
        AppendEntriesReply {
            term: self.current_term,
            success,
        }
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    pub fn handle_election_timeout(&mut self) -> io::Result<()> {
        match self.election.role() {
            Role::Follower | Role::Candidate => {}
            Role::Leader | Role::Dead => return Ok(()),
        }

        // > On conversion to candidate, start election: increment
        // > currentTerm, vote for self, reset election timer, send
        // > RequestVote RPCs to all other servers (§5.2)
        self.current_term += 1;
        self.voted_for = Some(self.cluster.me());
        self.storage.save_vote(self.current_term, self.voted_for)?;
        self.election
            .transition_to_candidate(self.current_term, self.cluster.me());
        self.publish_status();
        slog::info!(self.logger, "election timeout; campaigning"; "term" => self.current_term);

        // A cluster of one elects itself.
        if self.cluster.is_majority(1) {
            return self.become_leader();
        }

        let args = RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.cluster.me(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.cluster.peer_ids() {
            let transport = Arc::clone(&self.transport);
            let actor = self.actor_client.clone();
            let args = args.clone();
            let term = self.current_term;
            tokio::spawn(async move {
                let result = transport.request_vote(peer, args).await;
                actor.vote_reply(peer, term, result).await;
            });
        }
        Ok(())
    }

    pub fn handle_vote_reply(
        &mut self,
        peer: ReplicaId,
        sent_term: Term,
        result: Result<RequestVoteReply, TransportError>,
    ) -> io::Result<()> {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // Transient; the next election round will retry this peer.
                slog::debug!(self.logger, "RequestVote failed"; "peer" => peer, "error" => %e);
                return Ok(());
            }
        };

        if reply.term > self.current_term {
            return self.step_down(reply.term, None);
        }

        // Stale completion: only count votes for the election we are still
        // running right now.
        if sent_term != self.current_term || !self.election.is_candidate_for(sent_term) {
            return Ok(());
        }

        if reply.term == self.current_term && reply.vote_granted {
            let votes = self.election.add_vote(sent_term, peer);
            slog::debug!(self.logger, "vote received"; "votes" => votes, "term" => sent_term);
            if self.cluster.is_majority(votes) {
                return self.become_leader();
            }
        }
        Ok(())
    }

    fn become_leader(&mut self) -> io::Result<()> {
        let term = self.current_term;
        slog::info!(self.logger, "won election; leading"; "term" => term);

        // Term-begin entry. Committing it commits every surviving entry
        // from earlier terms, since the commitment rule only counts entries
        // of the current term; it also lets reads resume without waiting
        // for a client write.
        let noop = LogEntry {
            term,
            command: Command::Noop,
        };
        let noop_index = self.log.append(noop.clone());
        self.storage.append_entries(&[noop])?;

        self.election
            .transition_to_leader(term, &self.cluster, noop_index);
        self.publish_status();

        // A cluster of one commits as it appends.
        self.try_advance_commit();
        Ok(())
    }

    // ------------------------------------------------------------------
    // AppendEntries, sender side
    // ------------------------------------------------------------------

    pub fn handle_leader_tick(&mut self, peer: ReplicaId, timer_term: Term) {
        // Ticks from a previous reign arrive until the old timer notices
        // its handle was dropped.
        if self.election.leader_term() != Some(timer_term) || timer_term != self.current_term {
            return;
        }
        let next = match self.election.next_index(peer) {
            Some(next) => next,
            None => return,
        };

        let prev = next - 1;
        let args = AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.cluster.me(),
            prev_log_index: prev,
            prev_log_term: self.log.term_at(prev),
            entries: self.log.slice_from(next),
            leader_commit: self.commit_index,
        };
        let sent = args.entries.len();

        let transport = Arc::clone(&self.transport);
        let actor = self.actor_client.clone();
        let term = self.current_term;
        tokio::spawn(async move {
            let result = transport.append_entries(peer, args).await;
            actor.append_reply(peer, term, prev, sent, result).await;
        });
    }

    pub fn handle_append_reply(
        &mut self,
        peer: ReplicaId,
        sent_term: Term,
        prev_index: LogIndex,
        sent: usize,
        result: Result<AppendEntriesReply, TransportError>,
    ) -> io::Result<()> {
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // Transient; the peer's heartbeat timer retries shortly.
                slog::debug!(self.logger, "AppendEntries failed"; "peer" => peer, "error" => %e);
                return Ok(());
            }
        };

        if reply.term > self.current_term {
            return self.step_down(reply.term, None);
        }

        // Guard against replies to RPCs from a previous reign.
        if self.election.leader_term() != Some(sent_term) || sent_term != self.current_term {
            return Ok(());
        }

        if reply.success {
            // > If successful: update nextIndex and matchIndex for
            // > follower (§5.3)
            self.election
                .record_replicated(peer, prev_index + sent as LogIndex);
            self.try_advance_commit();
        } else {
            // > If AppendEntries fails because of log inconsistency:
            // > decrement nextIndex and retry (§5.3)
            self.election.decrement_next_index(peer);
        }
        Ok(())
    }

    // > If there exists an N such that N > commitIndex, a majority of
    // > matchIndex[i] >= N, and log[N].term == currentTerm:
    // > set commitIndex = N (§5.3, §5.4)
    fn try_advance_commit(&mut self) {
        let mut best = self.commit_index;
        for n in (self.commit_index + 1)..=self.log.last_index() {
            if self.log.term_at(n) != self.current_term {
                continue;
            }
            if self
                .cluster
                .is_majority(self.election.replicated_count(n))
            {
                best = n;
            }
        }
        if best > self.commit_index {
            slog::debug!(self.logger, "commit index advanced"; "from" => self.commit_index, "to" => best);
            self.commit_index = best;
            self.dispatch_apply_notices();
        }
    }

    // ------------------------------------------------------------------
    // Client writes
    // ------------------------------------------------------------------

    pub fn handle_submit(
        &mut self,
        command: Command,
    ) -> io::Result<Result<WriteReceipt, SubmitError>> {
        if self.election.role() != Role::Leader {
            return Ok(Err(SubmitError::NotLeader {
                hint: self.leader_hint(),
            }));
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let entry = LogEntry {
            term: self.current_term,
            command,
        };
        let index = self.log.append(entry.clone());
        self.storage.append_entries(&[entry])?;
        slog::debug!(self.logger, "accepted write"; "index" => index, "term" => self.current_term);

        // The entry travels with the next heartbeat tick per peer; in a
        // cluster of one it is already committed.
        self.try_advance_commit();
        Ok(Ok(WriteReceipt {
            index,
            term: self.current_term,
        }))
    }

    // ------------------------------------------------------------------
    // Shared transitions
    // ------------------------------------------------------------------

    fn step_down(&mut self, new_term: Term, leader_id: Option<ReplicaId>) -> io::Result<()> {
        slog::info!(
            self.logger, "stepping down to follower";
            "from_term" => self.current_term,
            "to_term" => new_term,
        );
        // The vote only resets when the term actually moves; a candidate
        // yielding to a same-term leader keeps its (self-)vote, or it could
        // be granted twice within one term.
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = None;
            self.storage.save_vote(new_term, None)?;
        }
        self.election.transition_to_follower(leader_id);
        self.publish_status();
        Ok(())
    }

    pub fn handle_shutdown(&mut self) {
        slog::info!(self.logger, "replica shutting down");
        self.election.transition_to_dead();
        self.publish_status();
    }

    fn dispatch_apply_notices(&mut self) {
        while self.last_dispatched < self.commit_index {
            let index = self.last_dispatched + 1;
            let entry = self
                .log
                .entry(index)
                .expect("commit index points past the end of the log");
            let notice = CommitNotice {
                index,
                term: entry.term,
                command: entry.command.clone(),
            };
            if self.apply_tx.send(notice).is_err() {
                // Only possible during shutdown teardown.
                return;
            }
            self.last_dispatched = index;
        }
    }

    fn leader_hint(&self) -> Option<String> {
        self.election
            .known_leader(self.cluster.me())
            .and_then(|id| self.cluster.addr_of(id))
            .map(str::to_string)
    }

    fn publish_status(&self) {
        let status = NodeStatus {
            role: self.election.role(),
            term: self.current_term,
            leader_addr: self.leader_hint(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport that records every outbound RPC and answers "unreachable";
    /// tests feed replies back through the reply handlers directly.
    #[derive(Default)]
    struct RecordingTransport {
        votes: Mutex<Vec<(ReplicaId, RequestVoteArgs)>>,
        appends: Mutex<Vec<(ReplicaId, AppendEntriesArgs)>>,
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn request_vote(
            &self,
            peer: ReplicaId,
            args: RequestVoteArgs,
        ) -> Result<RequestVoteReply, TransportError> {
            self.votes.lock().unwrap().push((peer, args));
            Err(TransportError::Unreachable("recording transport".to_string()))
        }

        async fn append_entries(
            &self,
            peer: ReplicaId,
            args: AppendEntriesArgs,
        ) -> Result<AppendEntriesReply, TransportError> {
            self.appends.lock().unwrap().push((peer, args));
            Err(TransportError::Unreachable("recording transport".to_string()))
        }
    }

    struct Harness {
        replica: Replica<MemoryStorage, RecordingTransport>,
        transport: Arc<RecordingTransport>,
        apply_rx: mpsc::UnboundedReceiver<CommitNotice>,
        status_rx: watch::Receiver<NodeStatus>,
        _event_rx: mpsc::Receiver<crate::actor::Event>,
    }

    fn harness(cluster_size: usize, durable: DurableState) -> Harness {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            role: Role::Follower,
            term: 0,
            leader_addr: None,
        });
        let transport = Arc::new(RecordingTransport::default());

        let peers = (1..cluster_size)
            .map(|i| crate::replica::peers::Peer {
                id: i as ReplicaId,
                addr: format!("127.0.0.1:{}", 7000 + i),
            })
            .collect();
        let cluster = ClusterView::new(0, "127.0.0.1:7000".to_string(), peers);

        let replica = Replica::new(ReplicaConfig {
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            cluster,
            storage: MemoryStorage::new(),
            transport: Arc::clone(&transport),
            timing: TimingOptions::default(),
            actor_client: ActorClient::new(event_tx),
            durable,
            apply_tx,
            status_tx,
        });

        Harness {
            replica,
            transport,
            apply_rx,
            status_rx,
            _event_rx: event_rx,
        }
    }

    fn add(title: &str) -> Command {
        Command::Add {
            title: title.to_string(),
            artist: "artist".to_string(),
            url: "url".to_string(),
            year: "2000".to_string(),
        }
    }

    fn entry(term: Term, command: Command) -> LogEntry {
        LogEntry { term, command }
    }

    fn seeded(term: Term, entries: Vec<LogEntry>) -> DurableState {
        DurableState {
            current_term: term,
            voted_for: None,
            entries,
        }
    }

    fn granted(term: Term) -> Result<RequestVoteReply, TransportError> {
        Ok(RequestVoteReply {
            term,
            vote_granted: true,
        })
    }

    /// Drives a 3-replica harness to leadership at term `current + 1`.
    fn make_leader(h: &mut Harness) -> Term {
        h.replica.handle_election_timeout().unwrap();
        let term = h.replica.current_term;
        h.replica.handle_vote_reply(1, term, granted(term)).unwrap();
        assert_eq!(h.replica.election.role(), Role::Leader);
        term
    }

    #[tokio::test]
    async fn follower_accepts_entries_from_scratch() {
        let mut h = harness(3, DurableState::default());

        let reply = h
            .replica
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: -1,
                prev_log_term: -1,
                entries: vec![entry(1, add("e0"))],
                leader_commit: 0,
            })
            .unwrap();

        assert!(reply.success);
        assert_eq!(reply.term, 1);
        assert_eq!(h.replica.log.last_index(), 0);
        assert_eq!(h.replica.commit_index, 0);

        let notice = h.apply_rx.recv().await.unwrap();
        assert_eq!(notice.index, 0);
        assert_eq!(notice.term, 1);
    }

    #[tokio::test]
    async fn follower_rejects_stale_term() {
        let mut h = harness(3, seeded(5, vec![]));

        let reply = h
            .replica
            .handle_append_entries(AppendEntriesArgs {
                term: 3,
                leader_id: 1,
                prev_log_index: -1,
                prev_log_term: -1,
                entries: vec![],
                leader_commit: -1,
            })
            .unwrap();

        assert!(!reply.success);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn follower_rejects_missing_prev_entry() {
        let mut h = harness(3, DurableState::default());

        let reply = h
            .replica
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(1, add("x"))],
                leader_commit: -1,
            })
            .unwrap();

        assert!(!reply.success);
        assert!(h.replica.log.is_empty());
    }

    #[tokio::test]
    async fn follower_repairs_conflicting_suffix() {
        let seed = vec![
            entry(1, add("a")),
            entry(1, add("b")),
            entry(2, add("c")),
        ];
        let mut h = harness(3, seeded(2, seed));

        let d = entry(3, add("d"));
        let reply = h
            .replica
            .handle_append_entries(AppendEntriesArgs {
                term: 3,
                leader_id: 1,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![d.clone()],
                leader_commit: -1,
            })
            .unwrap();

        assert!(reply.success);
        assert_eq!(h.replica.log.last_index(), 2);
        assert_eq!(h.replica.log.entry(2), Some(&d));
        assert_eq!(h.replica.log.term_at(1), 1, "matching prefix untouched");
    }

    #[tokio::test]
    async fn duplicate_append_entries_is_idempotent() {
        let mut h = harness(3, DurableState::default());
        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: -1,
            prev_log_term: -1,
            entries: vec![entry(1, add("a")), entry(1, add("b"))],
            leader_commit: -1,
        };

        assert!(h.replica.handle_append_entries(args.clone()).unwrap().success);
        let log_after_first = h.replica.log.clone();
        assert!(h.replica.handle_append_entries(args).unwrap().success);
        assert_eq!(h.replica.log, log_after_first);
    }

    #[tokio::test]
    async fn vote_granted_once_per_term() {
        let mut h = harness(3, DurableState::default());
        let args = RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: -1,
            last_log_term: -1,
        };

        let reply = h.replica.handle_request_vote(args.clone()).unwrap();
        assert!(reply.vote_granted);

        // Same candidate retries: still granted.
        let reply = h.replica.handle_request_vote(args).unwrap();
        assert!(reply.vote_granted);

        // A different candidate in the same term is refused.
        let reply = h
            .replica
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: -1,
                last_log_term: -1,
            })
            .unwrap();
        assert!(!reply.vote_granted);
    }

    #[tokio::test]
    async fn vote_refused_for_less_up_to_date_log() {
        let seed = vec![entry(1, add("a")), entry(2, add("b"))];
        let mut h = harness(3, seeded(2, seed));

        // Older last term loses.
        let reply = h
            .replica
            .handle_request_vote(RequestVoteArgs {
                term: 3,
                candidate_id: 1,
                last_log_index: 5,
                last_log_term: 1,
            })
            .unwrap();
        assert!(!reply.vote_granted);

        // Equal last term but shorter log loses.
        let reply = h
            .replica
            .handle_request_vote(RequestVoteArgs {
                term: 4,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 2,
            })
            .unwrap();
        assert!(!reply.vote_granted);

        // Equal last term, at least as long: granted.
        let reply = h
            .replica
            .handle_request_vote(RequestVoteArgs {
                term: 5,
                candidate_id: 1,
                last_log_index: 1,
                last_log_term: 2,
            })
            .unwrap();
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn election_timeout_starts_campaign() {
        let mut h = harness(3, DurableState::default());
        h.replica.handle_election_timeout().unwrap();

        assert_eq!(h.replica.current_term, 1);
        assert_eq!(h.replica.voted_for, Some(0));
        assert_eq!(h.replica.election.role(), Role::Candidate);

        // The RequestVote fan-out happens on spawned tasks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let votes = h.transport.votes.lock().unwrap();
        let mut asked: Vec<ReplicaId> = votes.iter().map(|(peer, _)| *peer).collect();
        asked.sort_unstable();
        assert_eq!(asked, vec![1, 2]);
        assert_eq!(votes[0].1.term, 1);
        assert_eq!(votes[0].1.last_log_index, -1);
        assert_eq!(votes[0].1.last_log_term, -1);
    }

    #[tokio::test]
    async fn majority_votes_make_a_leader_with_term_begin_entry() {
        let mut h = harness(3, DurableState::default());
        let term = make_leader(&mut h);

        assert_eq!(term, 1);
        assert_eq!(h.replica.log.last_index(), 0);
        assert_eq!(
            h.replica.log.entry(0),
            Some(&entry(1, Command::Noop)),
            "term-begin entry appended on taking office"
        );
        assert_eq!(h.status_rx.borrow().role, Role::Leader);
        assert_eq!(
            h.status_rx.borrow().leader_addr.as_deref(),
            Some("127.0.0.1:7000")
        );
    }

    #[tokio::test]
    async fn stale_and_duplicate_votes_do_not_elect() {
        let mut h = harness(5, DurableState::default());
        h.replica.handle_election_timeout().unwrap();

        // A vote for an older election.
        h.replica.handle_vote_reply(1, 0, granted(0)).unwrap();
        // The same peer voting twice.
        h.replica.handle_vote_reply(1, 1, granted(1)).unwrap();
        h.replica.handle_vote_reply(1, 1, granted(1)).unwrap();
        assert_eq!(h.replica.election.role(), Role::Candidate);

        // A third distinct voter tips a 5-node cluster.
        h.replica.handle_vote_reply(2, 1, granted(1)).unwrap();
        assert_eq!(h.replica.election.role(), Role::Leader);
    }

    #[tokio::test]
    async fn leader_steps_down_on_higher_term_vote_reply() {
        let mut h = harness(3, DurableState::default());
        make_leader(&mut h);

        h.replica
            .handle_vote_reply(
                2,
                1,
                Ok(RequestVoteReply {
                    term: 5,
                    vote_granted: false,
                }),
            )
            .unwrap();

        assert_eq!(h.replica.election.role(), Role::Follower);
        assert_eq!(h.replica.current_term, 5);
        assert_eq!(h.replica.voted_for, None);
        assert_eq!(h.status_rx.borrow().role, Role::Follower);
    }

    #[tokio::test]
    async fn commitment_requires_current_term_entry() {
        // Leader at term 2 holding an uncommitted entry from term 1.
        let mut h = harness(3, seeded(1, vec![entry(1, add("old"))]));
        let term = make_leader(&mut h);
        assert_eq!(term, 2);
        let noop_index = 1;

        // A follower acknowledges only the term-1 entry: no commit, because
        // the commitment rule only counts entries of the current term.
        h.replica
            .handle_append_reply(1, term, -1, 1, Ok(AppendEntriesReply { term, success: true }))
            .unwrap();
        assert_eq!(h.replica.commit_index, -1);

        // Acknowledging through the term-2 noop commits it and everything
        // before it.
        h.replica
            .handle_append_reply(
                1,
                term,
                0,
                1,
                Ok(AppendEntriesReply { term, success: true }),
            )
            .unwrap();
        assert_eq!(h.replica.commit_index, noop_index);

        let first = h.apply_rx.recv().await.unwrap();
        let second = h.apply_rx.recv().await.unwrap();
        assert_eq!((first.index, first.term), (0, 1));
        assert_eq!((second.index, second.term), (1, 2));
    }

    #[tokio::test]
    async fn rejected_append_backs_off_next_index() {
        let mut h = harness(3, seeded(1, vec![entry(1, add("a")), entry(1, add("b"))]));
        let term = make_leader(&mut h);

        let before = h.replica.election.next_index(1).unwrap();
        h.replica
            .handle_append_reply(
                1,
                term,
                before - 1,
                0,
                Ok(AppendEntriesReply {
                    term,
                    success: false,
                }),
            )
            .unwrap();
        assert_eq!(h.replica.election.next_index(1), Some(before - 1));
    }

    #[tokio::test]
    async fn stale_append_reply_is_discarded() {
        let mut h = harness(3, DurableState::default());
        let term = make_leader(&mut h);

        // Step down via a higher-term vote reply, then deliver a leftover
        // append reply from the old reign: it must not touch anything.
        h.replica
            .handle_vote_reply(
                2,
                term,
                Ok(RequestVoteReply {
                    term: term + 3,
                    vote_granted: false,
                }),
            )
            .unwrap();
        let commit_before = h.replica.commit_index;
        h.replica
            .handle_append_reply(1, term, -1, 1, Ok(AppendEntriesReply { term, success: true }))
            .unwrap();
        assert_eq!(h.replica.commit_index, commit_before);
        assert_eq!(h.replica.election.role(), Role::Follower);
    }

    #[tokio::test]
    async fn submit_refused_when_not_leader() {
        let mut h = harness(3, DurableState::default());

        let result = h.replica.handle_submit(add("x")).unwrap();
        assert_eq!(
            result,
            Err(SubmitError::NotLeader { hint: None }),
            "fresh follower has no leader to hint at"
        );

        // Learn a leader, then refuse with its address.
        h.replica
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: -1,
                prev_log_term: -1,
                entries: vec![],
                leader_commit: -1,
            })
            .unwrap();
        let result = h.replica.handle_submit(add("y")).unwrap();
        assert_eq!(
            result,
            Err(SubmitError::NotLeader {
                hint: Some("127.0.0.1:7002".to_string())
            })
        );
        assert!(h.replica.log.is_empty(), "refused writes never touch the log");
    }

    #[tokio::test]
    async fn submitted_write_commits_after_majority_ack() {
        let mut h = harness(3, DurableState::default());
        let term = make_leader(&mut h);

        let receipt = h.replica.handle_submit(add("Kid A")).unwrap().unwrap();
        assert_eq!(receipt, WriteReceipt { index: 1, term });

        // Follower 1 acknowledges noop + write.
        h.replica
            .handle_append_reply(
                1,
                term,
                -1,
                2,
                Ok(AppendEntriesReply { term, success: true }),
            )
            .unwrap();
        assert_eq!(h.replica.commit_index, 1);

        let noop = h.apply_rx.recv().await.unwrap();
        let write = h.apply_rx.recv().await.unwrap();
        assert_eq!(noop.command, Command::Noop);
        assert_eq!((write.index, write.term), (receipt.index, receipt.term));
    }

    #[tokio::test]
    async fn single_replica_cluster_elects_and_commits_alone() {
        let mut h = harness(1, DurableState::default());
        h.replica.handle_election_timeout().unwrap();
        assert_eq!(h.replica.election.role(), Role::Leader);
        assert_eq!(h.replica.commit_index, 0, "noop self-commits");

        let receipt = h.replica.handle_submit(add("solo")).unwrap().unwrap();
        assert_eq!(h.replica.commit_index, receipt.index);
    }

    #[tokio::test]
    async fn dead_replica_ignores_everything() {
        let mut h = harness(3, DurableState::default());
        h.replica.handle_shutdown();
        assert_eq!(h.replica.election.role(), Role::Dead);

        let reply = h
            .replica
            .handle_request_vote(RequestVoteArgs {
                term: 9,
                candidate_id: 1,
                last_log_index: -1,
                last_log_term: -1,
            })
            .unwrap();
        assert!(!reply.vote_granted);

        h.replica.handle_election_timeout().unwrap();
        assert_eq!(h.replica.election.role(), Role::Dead);
    }
}
