//! The replica event loop.
//!
//! All consensus state lives behind one single-threaded actor: timers, peer
//! RPC servers, RPC completions, and the client gateway all enqueue events,
//! and the actor handles them one at a time. That serialization is the
//! "replica-wide lock" of the design; because `handle_event` is not async,
//! no network I/O can ever happen while consensus state is being mutated.

use crate::cmdlog::Command;
use crate::replica::{Replica, SubmitError, WriteReceipt};
use crate::storage::Storage;
use crate::transport::{PeerTransport, TransportError};
use crate::types::{LogIndex, ReplicaId, Term};
use crate::wire::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};
use std::fmt;
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error)]
#[error("replica event loop has exited")]
pub struct ActorDead;

#[derive(Debug, thiserror::Error)]
#[error("fatal storage failure: {0}")]
pub struct FatalError(#[from] pub std::io::Error);

#[derive(Debug)]
pub enum Event {
    /// A peer asks for our vote.
    RequestVote(RequestVoteArgs, Callback<RequestVoteReply>),
    /// The leader replicates entries (or heartbeats) to us.
    AppendEntries(AppendEntriesArgs, Callback<AppendEntriesReply>),
    /// Completion of a `RequestVote` RPC we sent while campaigning in `term`.
    VoteReply {
        peer: ReplicaId,
        term: Term,
        result: Result<RequestVoteReply, TransportError>,
    },
    /// Completion of an `AppendEntries` RPC we sent while leading in `term`.
    /// `prev_index` and `sent` identify which suffix the peer acknowledged.
    AppendReply {
        peer: ReplicaId,
        term: Term,
        prev_index: LogIndex,
        sent: usize,
        result: Result<AppendEntriesReply, TransportError>,
    },
    /// A client write to be appended and replicated.
    Submit(Command, Callback<Result<WriteReceipt, SubmitError>>),
    /// Per-peer heartbeat tick from a leader timer spawned at `term`.
    LeaderTick { peer: ReplicaId, term: Term },
    /// The election countdown expired without hearing from a leader.
    ElectionTimeout,
    /// Stop the replica; acknowledged once the role is Dead.
    Shutdown(Callback<()>),
}

pub struct Callback<T>(oneshot::Sender<T>);

impl<T> Callback<T> {
    pub fn send(self, value: T) {
        // The requester may have hung up (connection drop, timeout);
        // consensus state has already been updated either way.
        let _ = self.0.send(value);
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback").finish()
    }
}

/// Cheap cloneable handle for enqueueing events onto a replica's loop.
#[derive(Clone)]
pub struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        ActorClient { sender }
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteReply, ActorDead> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::RequestVote(args, Callback(tx))).await?;
        rx.await.map_err(|_| ActorDead)
    }

    pub async fn append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, ActorDead> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendEntries(args, Callback(tx))).await?;
        rx.await.map_err(|_| ActorDead)
    }

    pub async fn submit(&self, command: Command) -> Result<WriteReceipt, SubmitError> {
        let (tx, rx) = oneshot::channel();
        if self
            .send(Event::Submit(command, Callback(tx)))
            .await
            .is_err()
        {
            return Err(SubmitError::Shutdown);
        }
        rx.await.map_err(|_| SubmitError::Shutdown)?
    }

    pub async fn vote_reply(
        &self,
        peer: ReplicaId,
        term: Term,
        result: Result<RequestVoteReply, TransportError>,
    ) {
        let _ = self.send(Event::VoteReply { peer, term, result }).await;
    }

    pub async fn append_reply(
        &self,
        peer: ReplicaId,
        term: Term,
        prev_index: LogIndex,
        sent: usize,
        result: Result<AppendEntriesReply, TransportError>,
    ) {
        let _ = self
            .send(Event::AppendReply {
                peer,
                term,
                prev_index,
                sent,
                result,
            })
            .await;
    }

    pub async fn election_timeout(&self) {
        let _ = self.send(Event::ElectionTimeout).await;
    }

    /// Returns false once the event loop is gone, so timer tasks can exit.
    pub async fn leader_tick(&self, peer: ReplicaId, term: Term) -> bool {
        self.send(Event::LeaderTick { peer, term }).await.is_ok()
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::Shutdown(Callback(tx))).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorDead> {
        self.sender.send(event).await.map_err(|_| ActorDead)
    }
}

/// Owns the replica state and drains the event queue. Runs until shutdown,
/// until every client handle is dropped, or until a fatal storage failure.
pub struct ReplicaActor<S: Storage, T: PeerTransport> {
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<S, T>,
}

impl<S: Storage, T: PeerTransport> ReplicaActor<S, T> {
    pub fn new(
        logger: slog::Logger,
        receiver: mpsc::Receiver<Event>,
        replica: Replica<S, T>,
    ) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub async fn run(mut self) -> Result<(), FatalError> {
        while let Some(event) = self.receiver.recv().await {
            slog::trace!(self.logger, "event: {:?}", event);
            match self.handle_event(event) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(e) => {
                    slog::crit!(self.logger, "fatal storage failure: {}", e);
                    return Err(FatalError(e));
                }
            }
        }
        Ok(())
    }

    // Must stay non-async: anything slow belongs in a spawned task that
    // reports back through an event.
    fn handle_event(&mut self, event: Event) -> std::io::Result<ControlFlow<()>> {
        match event {
            Event::RequestVote(args, callback) => {
                callback.send(self.replica.handle_request_vote(args)?);
            }
            Event::AppendEntries(args, callback) => {
                callback.send(self.replica.handle_append_entries(args)?);
            }
            Event::VoteReply { peer, term, result } => {
                self.replica.handle_vote_reply(peer, term, result)?;
            }
            Event::AppendReply {
                peer,
                term,
                prev_index,
                sent,
                result,
            } => {
                self.replica
                    .handle_append_reply(peer, term, prev_index, sent, result)?;
            }
            Event::Submit(command, callback) => {
                callback.send(self.replica.handle_submit(command)?);
            }
            Event::LeaderTick { peer, term } => {
                self.replica.handle_leader_tick(peer, term);
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout()?;
            }
            Event::Shutdown(callback) => {
                self.replica.handle_shutdown();
                callback.send(());
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}
