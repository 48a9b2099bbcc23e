use crate::store::{Album, AlbumStore, StoreError};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A state-machine command. Commands are the only way the album store
/// mutates; everything else is a pure read.
///
/// `Noop` is the term-begin entry a fresh leader appends so that entries from
/// prior terms become committable under the current-term commitment rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Noop,
    Add {
        title: String,
        artist: String,
        url: String,
        year: String,
    },
    Edit {
        id: String,
        title: String,
        artist: String,
        url: String,
        year: String,
    },
    Remove {
        id: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub command: Command,
}

/// What applying one command did to the store. Carried back to the client
/// gateway so it can answer the request that produced the entry.
#[derive(Clone, Debug, PartialEq)]
pub enum ApplyOutcome {
    Noop,
    Added(Album),
    Edited(Album),
    Removed(String),
    Rejected(StoreError),
}

impl ApplyOutcome {
    pub fn ok(&self) -> bool {
        !matches!(self, ApplyOutcome::Rejected(_))
    }
}

/// Applies a single command to the store. This is the one deterministic
/// transition function: the apply loop and `replay` both go through it.
pub fn apply_command(store: &mut AlbumStore, command: &Command) -> ApplyOutcome {
    match command {
        Command::Noop => ApplyOutcome::Noop,
        Command::Add {
            title,
            artist,
            url,
            year,
        } => ApplyOutcome::Added(store.add(title, artist, url, year)),
        Command::Edit {
            id,
            title,
            artist,
            url,
            year,
        } => match store.edit(id, title, artist, url, year) {
            Ok(album) => ApplyOutcome::Edited(album),
            Err(e) => ApplyOutcome::Rejected(e),
        },
        Command::Remove { id } => match store.remove(id) {
            Ok(()) => ApplyOutcome::Removed(id.clone()),
            Err(e) => ApplyOutcome::Rejected(e),
        },
    }
}

/// Ordered, append-only sequence of `(term, command)` entries. Indices are
/// zero-based; `-1` stands for "before the first entry".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandLog {
    entries: Vec<LogEntry>,
}

impl CommandLog {
    pub fn new() -> Self {
        CommandLog { entries: Vec::new() }
    }

    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        CommandLog { entries }
    }

    /// Appends at the end of the log and returns the new entry's index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.entries.len() as LogIndex - 1
    }

    /// Drops all entries at indices >= `index`. Only followers repairing a
    /// conflict ever call this.
    pub fn truncate_from(&mut self, index: LogIndex) {
        let keep = index.max(0) as usize;
        self.entries.truncate(keep);
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < 0 {
            return None;
        }
        self.entries.get(index as usize)
    }

    /// Clones the suffix starting at `from` (the replication payload for a
    /// peer whose `next_index` is `from`).
    pub fn slice_from(&self, from: LogIndex) -> Vec<LogEntry> {
        let from = from.max(0) as usize;
        if from >= self.entries.len() {
            return Vec::new();
        }
        self.entries[from..].to_vec()
    }

    /// Term of the entry at `index`, or `-1` when there is no such entry.
    pub fn term_at(&self, index: LogIndex) -> Term {
        self.entry(index).map(|e| e.term).unwrap_or(-1)
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex - 1
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(-1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Reconstructs a store by applying every entry in order. Pure: the
    /// result depends only on the log contents.
    pub fn replay(&self, store: &mut AlbumStore) {
        for entry in &self.entries {
            apply_command(store, &entry.command);
        }
    }
}
