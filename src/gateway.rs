//! The data-plane endpoint of one replica.
//!
//! Frontends speak `DataMessage`; this module decides whether the local
//! replica may serve the request, turns writes into commands for the
//! consensus module, and only answers once the write has been applied to the
//! local store. Anything a non-leader cannot serve comes back as `NotLeader`
//! with the best-known leader address as the hint.

use crate::actor::ActorClient;
use crate::apply::{AppliedEntry, ApplyProgress, StoreHandle};
use crate::cmdlog::{ApplyOutcome, Command};
use crate::replica::{NodeStatus, Role, SubmitError, WriteReceipt};
use crate::wire::{method, DataMessage};
use tokio::sync::{broadcast, watch};

#[derive(Clone)]
pub struct Gateway {
    logger: slog::Logger,
    actor: ActorClient,
    store: StoreHandle,
    status_rx: watch::Receiver<NodeStatus>,
    progress_rx: watch::Receiver<ApplyProgress>,
    applied_tx: broadcast::Sender<AppliedEntry>,
}

impl Gateway {
    pub fn new(
        logger: slog::Logger,
        actor: ActorClient,
        store: StoreHandle,
        status_rx: watch::Receiver<NodeStatus>,
        progress_rx: watch::Receiver<ApplyProgress>,
        applied_tx: broadcast::Sender<AppliedEntry>,
    ) -> Self {
        Gateway {
            logger,
            actor,
            store,
            status_rx,
            progress_rx,
            applied_tx,
        }
    }

    pub async fn handle(&self, request: DataMessage) -> DataMessage {
        slog::debug!(self.logger, "data request"; "method" => %request.method);
        match request.method.as_str() {
            method::GET_ALL_ALBUMS => self.handle_get_all(),
            method::GET_ALBUM => self.handle_get(&request),
            method::ADD_ALBUM => self.handle_add(request).await,
            method::EDIT_ALBUM => self.handle_edit(request).await,
            method::DELETE_ALBUM => self.handle_delete(request).await,
            other => {
                slog::warn!(self.logger, "unknown data method"; "method" => other);
                DataMessage {
                    method: other.to_string(),
                    ..DataMessage::default()
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Reads are linearizable only on a leader that has applied at least one
    /// entry of its own term (the term-begin entry at the latest). Anything
    /// earlier could serve a stale view from a deposed reign.
    fn read_barrier(&self) -> Result<(), DataMessage> {
        let status = self.status_rx.borrow().clone();
        if status.role != Role::Leader {
            return Err(DataMessage::not_leader(status.leader_addr));
        }
        let progress = *self.progress_rx.borrow();
        if progress.last_applied_term != status.term {
            // We lead, but our store does not yet reflect this term; the
            // hint points the client back at us for a near-future retry.
            return Err(DataMessage::not_leader(status.leader_addr));
        }
        Ok(())
    }

    fn handle_get_all(&self) -> DataMessage {
        if let Err(redirect) = self.read_barrier() {
            return redirect;
        }
        DataMessage {
            method: method::GET_ALL_ALBUMS.to_string(),
            index: String::new(),
            albums: self.store.get_all(),
            status: true,
        }
    }

    fn handle_get(&self, request: &DataMessage) -> DataMessage {
        if let Err(redirect) = self.read_barrier() {
            return redirect;
        }
        match self.store.get(&request.index) {
            Ok(album) => DataMessage {
                method: method::GET_ALBUM.to_string(),
                index: album.id.clone(),
                albums: vec![album],
                status: true,
            },
            Err(e) => {
                slog::debug!(self.logger, "read failed"; "id" => %request.index, "error" => %e);
                DataMessage {
                    method: method::GET_ALBUM.to_string(),
                    ..DataMessage::default()
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    async fn handle_add(&self, request: DataMessage) -> DataMessage {
        let album = match request.albums.into_iter().next() {
            Some(album) => album,
            None => return bad_request(method::ADD_ALBUM),
        };
        self.write(
            method::ADD_ALBUM,
            Command::Add {
                title: album.title,
                artist: album.artist,
                url: album.url,
                year: album.year,
            },
        )
        .await
    }

    async fn handle_edit(&self, request: DataMessage) -> DataMessage {
        if !is_well_formed_id(&request.index) {
            return bad_request(method::EDIT_ALBUM);
        }
        let album = match request.albums.into_iter().next() {
            Some(album) => album,
            None => return bad_request(method::EDIT_ALBUM),
        };
        self.write(
            method::EDIT_ALBUM,
            Command::Edit {
                id: request.index,
                title: album.title,
                artist: album.artist,
                url: album.url,
                year: album.year,
            },
        )
        .await
    }

    async fn handle_delete(&self, request: DataMessage) -> DataMessage {
        if !is_well_formed_id(&request.index) {
            return bad_request(method::DELETE_ALBUM);
        }
        self.write(method::DELETE_ALBUM, Command::Remove { id: request.index })
            .await
    }

    /// Appends the command on the leader and waits for its local apply.
    /// The wait is keyed on the exact `(index, term)` the entry received:
    /// if that slot ends up applied under a different term, or this replica
    /// stops leading in the receipt's term, the write is not known to have
    /// happened and the client is redirected.
    async fn write(&self, reply_method: &str, command: Command) -> DataMessage {
        // Subscribe before submitting so the apply broadcast cannot race
        // past us.
        let mut applied_rx = self.applied_tx.subscribe();

        let receipt = match self.actor.submit(command).await {
            Ok(receipt) => receipt,
            Err(SubmitError::NotLeader { hint }) => return DataMessage::not_leader(hint),
            Err(SubmitError::Shutdown) => return DataMessage::not_leader(None),
        };

        match self.await_applied(&mut applied_rx, receipt).await {
            Some(outcome) => applied_reply(reply_method, outcome),
            None => {
                let hint = self.status_rx.borrow().leader_addr.clone();
                DataMessage::not_leader(hint)
            }
        }
    }

    async fn await_applied(
        &self,
        applied_rx: &mut broadcast::Receiver<AppliedEntry>,
        receipt: WriteReceipt,
    ) -> Option<ApplyOutcome> {
        let mut status_rx = self.status_rx.clone();
        loop {
            tokio::select! {
                applied = applied_rx.recv() => match applied {
                    Ok(entry) if entry.index == receipt.index => {
                        if entry.term == receipt.term {
                            return Some(entry.outcome);
                        }
                        // Our slot was overwritten by another leader's entry.
                        return None;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        slog::warn!(self.logger, "apply broadcast lagged"; "skipped" => n);
                        // Our notification may be among the lost ones; the
                        // client retries rather than waiting forever.
                        if self.progress_rx.borrow().last_applied >= receipt.index {
                            return None;
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    let status = status_rx.borrow().clone();
                    if status.role != Role::Leader || status.term != receipt.term {
                        // Stepped down before the entry applied locally. The
                        // command may still commit under the next leader; the
                        // client owns idempotency across this retry.
                        return None;
                    }
                }
            }
        }
    }
}

fn is_well_formed_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

fn bad_request(reply_method: &str) -> DataMessage {
    DataMessage {
        method: reply_method.to_string(),
        ..DataMessage::default()
    }
}

fn applied_reply(reply_method: &str, outcome: ApplyOutcome) -> DataMessage {
    let mut reply = DataMessage {
        method: reply_method.to_string(),
        index: String::new(),
        albums: Vec::new(),
        status: outcome.ok(),
    };
    match outcome {
        ApplyOutcome::Added(album) | ApplyOutcome::Edited(album) => {
            reply.index = album.id.clone();
            reply.albums.push(album);
        }
        ApplyOutcome::Removed(id) => reply.index = id,
        ApplyOutcome::Noop | ApplyOutcome::Rejected(_) => {}
    }
    reply
}
