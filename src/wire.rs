//! Wire types shared by replicas, the client gateway, and frontends.
//!
//! Everything on the wire is a length-prefixed bincode frame: a big-endian
//! u32 payload length followed by the serialized value. Peer RPCs and
//! data-plane messages share one listener, so frames carry a tagged
//! request/response envelope.

use crate::cmdlog::LogEntry;
use crate::store::Album;
use crate::types::{LogIndex, ReplicaId, Term};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Generous for an album table; mostly a
/// guard against a garbage length prefix allocating gigabytes.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Invoked by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: ReplicaId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

/// Invoked by the leader to replicate log entries; also used as heartbeat.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: ReplicaId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
}

/// Data-plane message exchanged between frontends and the client gateway.
/// `index` is the decimal string form of an album id; a `NotLeader` reply
/// carries the hinted leader address in `index` instead (empty if unknown).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub method: String,
    pub index: String,
    pub albums: Vec<Album>,
    pub status: bool,
}

pub mod method {
    pub const GET_ALL_ALBUMS: &str = "GetAllAlbums";
    pub const GET_ALBUM: &str = "GetAlbum";
    pub const ADD_ALBUM: &str = "AddAlbum";
    pub const EDIT_ALBUM: &str = "EditAlbum";
    pub const DELETE_ALBUM: &str = "DeleteAlbum";
    pub const NOT_LEADER: &str = "NotLeader";
}

impl DataMessage {
    pub fn request(method: &str) -> Self {
        DataMessage {
            method: method.to_string(),
            ..DataMessage::default()
        }
    }

    pub fn not_leader(hint: Option<String>) -> Self {
        DataMessage {
            method: method::NOT_LEADER.to_string(),
            index: hint.unwrap_or_default(),
            albums: Vec::new(),
            status: false,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        self.method == method::NOT_LEADER
    }
}

/// Envelope for the shared replica listener.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    Data(DataMessage),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    Data(DataMessage),
}

pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload =
        bincode::serialize(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
