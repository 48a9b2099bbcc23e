//! Durable replica state: `current_term`, `voted_for`, and the command log.
//!
//! Safety depends on these surviving restart and on every write hitting disk
//! before any RPC reply that depends on it, so all mutating operations fsync
//! before returning. The on-disk layout is a small JSON metadata file plus an
//! append-mostly binary log file.

use crate::cmdlog::LogEntry;
use crate::types::{LogIndex, ReplicaId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Everything a replica reloads at boot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DurableState {
    pub current_term: Term,
    pub voted_for: Option<ReplicaId>,
    pub entries: Vec<LogEntry>,
}

/// Durable store for algorithm-critical replica state. Only writes that the
/// consensus rules require to be persisted go through here.
pub trait Storage: Send + 'static {
    /// Persists the term/vote pair. Must be durable before the caller sends
    /// any reply carrying or implied by these values.
    fn save_vote(&mut self, term: Term, voted_for: Option<ReplicaId>) -> io::Result<()>;

    /// Appends entries at the end of the durable log.
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// Drops durable entries at indices >= `index`.
    fn truncate_from(&mut self, index: LogIndex) -> io::Result<()>;

    /// Reloads the persisted state, tolerating a torn trailing log record
    /// from a crash mid-append.
    fn load(&mut self) -> io::Result<DurableState>;
}

#[derive(Serialize, Deserialize)]
struct Meta {
    current_term: Term,
    voted_for: Option<ReplicaId>,
}

/// File-backed storage: `meta.json` (rewritten via temp file + rename) and
/// `log.bin` (u32-length-prefixed bincode records). A record offset table is
/// kept in memory so truncation is a single `set_len`.
pub struct FileStorage {
    dir: PathBuf,
    log_file: File,
    /// Byte offset of each record in `log.bin`; one slot past the end holds
    /// the current file length.
    offsets: Vec<u64>,
}

impl FileStorage {
    /// Opens (creating if needed) the storage directory. Call `load` before
    /// the first append: it rebuilds the record offset table from the file.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(dir.join("log.bin"))?;

        Ok(FileStorage {
            dir,
            log_file,
            offsets: vec![0],
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn end_offset(&self) -> u64 {
        *self.offsets.last().expect("offset table always has the end slot")
    }

    fn encode_record(entry: &LogEntry) -> io::Result<Vec<u8>> {
        let payload = bincode::serialize(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut record = Vec::with_capacity(4 + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&payload);
        Ok(record)
    }
}

impl Storage for FileStorage {
    fn save_vote(&mut self, term: Term, voted_for: Option<ReplicaId>) -> io::Result<()> {
        let meta = Meta {
            current_term: term,
            voted_for,
        };
        let tmp_path = self.dir.join("meta.json.tmp");

        let mut tmp = File::create(&tmp_path)?;
        serde_json::to_writer(&mut tmp, &meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.meta_path())?;

        // Make the rename itself durable.
        File::open(&self.dir)?.sync_all()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        let mut next_offset = self.end_offset();
        let mut new_offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            let record = Self::encode_record(entry)?;
            next_offset += record.len() as u64;
            new_offsets.push(next_offset);
            buf.extend_from_slice(&record);
        }

        self.log_file.write_all(&buf)?;
        self.log_file.sync_data()?;
        self.offsets.extend(new_offsets);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> io::Result<()> {
        let keep = index.max(0) as usize;
        if keep + 1 >= self.offsets.len() {
            return Ok(());
        }

        let new_len = self.offsets[keep];
        self.log_file.set_len(new_len)?;
        self.log_file.seek(SeekFrom::End(0))?;
        self.log_file.sync_data()?;
        self.offsets.truncate(keep + 1);
        Ok(())
    }

    fn load(&mut self) -> io::Result<DurableState> {
        let mut state = DurableState::default();

        match fs::read(self.meta_path()) {
            Ok(raw) => {
                let meta: Meta = serde_json::from_slice(&raw)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                state.current_term = meta.current_term;
                state.voted_for = meta.voted_for;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let mut raw = Vec::new();
        self.log_file.seek(SeekFrom::Start(0))?;
        self.log_file.read_to_end(&mut raw)?;

        self.offsets = vec![0];
        let mut pos = 0usize;
        while raw.len() - pos >= 4 {
            let len = u32::from_be_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
                as usize;
            if raw.len() - pos - 4 < len {
                break; // torn tail record
            }
            let entry: LogEntry = bincode::deserialize(&raw[pos + 4..pos + 4 + len])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            state.entries.push(entry);
            pos += 4 + len;
            self.offsets.push(pos as u64);
        }

        // Discard any torn tail so the next append lands on a record edge.
        if pos < raw.len() {
            self.log_file.set_len(pos as u64)?;
            self.log_file.sync_data()?;
        }
        self.log_file.seek(SeekFrom::End(0))?;

        Ok(state)
    }
}

/// Storage that forgets on drop. For tests and throwaway clusters.
#[derive(Default)]
pub struct MemoryStorage {
    state: DurableState,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn save_vote(&mut self, term: Term, voted_for: Option<ReplicaId>) -> io::Result<()> {
        self.state.current_term = term;
        self.state.voted_for = voted_for;
        Ok(())
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.state.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> io::Result<()> {
        self.state.entries.truncate(index.max(0) as usize);
        Ok(())
    }

    fn load(&mut self) -> io::Result<DurableState> {
        Ok(self.state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdlog::Command;

    fn entry(term: Term, title: &str) -> LogEntry {
        LogEntry {
            term,
            command: Command::Add {
                title: title.to_string(),
                artist: "artist".to_string(),
                url: "url".to_string(),
                year: "2001".to_string(),
            },
        }
    }

    #[test]
    fn load_from_empty_dir_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.load().unwrap(), DurableState::default());
    }

    #[test]
    fn vote_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.save_vote(7, Some(2)).unwrap();
        }

        let mut reopened = FileStorage::open(dir.path()).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.current_term, 7);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.load().unwrap();
            storage
                .append_entries(&[entry(1, "a"), entry(1, "b"), entry(2, "c")])
                .unwrap();
        }

        let mut reopened = FileStorage::open(dir.path()).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.entries, vec![entry(1, "a"), entry(1, "b"), entry(2, "c")]);
    }

    #[test]
    fn truncate_then_append_replaces_suffix() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.load().unwrap();
            storage
                .append_entries(&[entry(1, "a"), entry(1, "b"), entry(2, "c")])
                .unwrap();
            storage.truncate_from(2).unwrap();
            storage.append_entries(&[entry(3, "d")]).unwrap();
        }

        let mut reopened = FileStorage::open(dir.path()).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.entries, vec![entry(1, "a"), entry(1, "b"), entry(3, "d")]);
    }

    #[test]
    fn torn_tail_record_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut storage = FileStorage::open(dir.path()).unwrap();
            storage.load().unwrap();
            storage.append_entries(&[entry(1, "a")]).unwrap();
        }

        // Simulate a crash mid-append: a length prefix with half a payload.
        let log_path = dir.path().join("log.bin");
        let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
        file.write_all(&100u32.to_be_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let mut reopened = FileStorage::open(dir.path()).unwrap();
        let state = reopened.load().unwrap();
        assert_eq!(state.entries, vec![entry(1, "a")]);

        // The tail was cut, so appending again round-trips cleanly.
        reopened.append_entries(&[entry(2, "b")]).unwrap();
        let mut again = FileStorage::open(dir.path()).unwrap();
        assert_eq!(
            again.load().unwrap().entries,
            vec![entry(1, "a"), entry(2, "b")]
        );
    }
}
