//! The apply loop: the only writer of the album store.
//!
//! The consensus module hands over committed entries in strict index order;
//! this task applies them one at a time and publishes what happened, both as
//! a broadcast (for gateway requests waiting on a specific entry) and as a
//! watch (for the read barrier: "has an entry of my term been applied?").

use crate::cmdlog::{apply_command, ApplyOutcome, Command};
use crate::store::{Album, AlbumStore, StoreError};
use crate::types::{LogIndex, Term};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, watch};

/// A committed entry traveling from the consensus module to the apply loop.
#[derive(Clone, Debug)]
pub struct CommitNotice {
    pub index: LogIndex,
    pub term: Term,
    pub command: Command,
}

/// Broadcast after an entry has been applied locally.
#[derive(Clone, Debug)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
    pub outcome: ApplyOutcome,
}

/// Progress of the local state machine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApplyProgress {
    pub last_applied: LogIndex,
    pub last_applied_term: Term,
}

impl ApplyProgress {
    pub fn none() -> Self {
        ApplyProgress {
            last_applied: -1,
            last_applied_term: -1,
        }
    }
}

/// Shared read handle over a replica's album store. Reads taken through a
/// non-leader (or outside the gateway's read barrier) are only eventually
/// consistent; the gateway enforces the leader + current-term-applied checks
/// before serving clients.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<AlbumStore>>,
}

impl StoreHandle {
    pub fn new(store: AlbumStore) -> Self {
        StoreHandle {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn get(&self, id: &str) -> Result<Album, StoreError> {
        self.read().get(id)
    }

    pub fn get_all(&self) -> Vec<Album> {
        self.read().get_all()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AlbumStore> {
        self.inner.read().expect("album store lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AlbumStore> {
        self.inner.write().expect("album store lock poisoned")
    }
}

pub struct ApplyTask {
    logger: slog::Logger,
    notices: mpsc::UnboundedReceiver<CommitNotice>,
    store: StoreHandle,
    progress_tx: watch::Sender<ApplyProgress>,
    applied_tx: broadcast::Sender<AppliedEntry>,
}

impl ApplyTask {
    pub fn new(
        logger: slog::Logger,
        notices: mpsc::UnboundedReceiver<CommitNotice>,
        store: StoreHandle,
        progress_tx: watch::Sender<ApplyProgress>,
        applied_tx: broadcast::Sender<AppliedEntry>,
    ) -> Self {
        ApplyTask {
            logger,
            notices,
            store,
            progress_tx,
            applied_tx,
        }
    }

    pub async fn run(mut self) {
        let mut last_applied: LogIndex = -1;
        while let Some(notice) = self.notices.recv().await {
            assert_eq!(
                notice.index,
                last_applied + 1,
                "commit notices must arrive in log order"
            );

            let outcome = apply_command(&mut self.store.write(), &notice.command);
            last_applied = notice.index;
            slog::debug!(
                self.logger, "applied entry";
                "index" => notice.index,
                "term" => notice.term,
                "ok" => outcome.ok(),
            );

            self.progress_tx.send_replace(ApplyProgress {
                last_applied,
                last_applied_term: notice.term,
            });
            // No receivers is fine; nobody is waiting on this entry.
            let _ = self.applied_tx.send(AppliedEntry {
                index: notice.index,
                term: notice.term,
                outcome,
            });
        }
    }
}
