use crate::replica::Peer;
use crate::transport::{PeerTransport, TransportError};
use crate::types::ReplicaId;
use crate::wire::{
    read_frame, write_frame, AppendEntriesArgs, AppendEntriesReply, Request, RequestVoteArgs,
    RequestVoteReply, Response,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connection lifecycle per peer. Tracking it explicitly lets a replica
/// start up before its peers are listening: the first successful call
/// connects, a failed call drops back to `Disconnected`, and the next
/// heartbeat or election round retries.
enum Conn {
    Connected(TcpStream),
    Disconnected,
}

struct PeerClient {
    addr: String,
    conn: Mutex<Conn>,
}

/// TCP implementation of `PeerTransport`. One lazily-connected stream per
/// peer; calls to the same peer serialize on its connection, and every call
/// is bounded by a deadline of one heartbeat period.
pub struct TcpTransport {
    logger: slog::Logger,
    peers: HashMap<ReplicaId, PeerClient>,
    rpc_timeout: Duration,
}

impl TcpTransport {
    pub fn new(logger: slog::Logger, peers: &[Peer], rpc_timeout: Duration) -> Self {
        let peers = peers
            .iter()
            .map(|peer| {
                (
                    peer.id,
                    PeerClient {
                        addr: peer.addr.clone(),
                        conn: Mutex::new(Conn::Disconnected),
                    },
                )
            })
            .collect();
        TcpTransport {
            logger,
            peers,
            rpc_timeout,
        }
    }

    /// Drops the connection to `peer`; the next call reconnects lazily.
    pub async fn disconnect(&self, peer: ReplicaId) {
        if let Some(client) = self.peers.get(&peer) {
            *client.conn.lock().await = Conn::Disconnected;
        }
    }

    async fn call(&self, peer: ReplicaId, request: Request) -> Result<Response, TransportError> {
        let client = self
            .peers
            .get(&peer)
            .ok_or_else(|| TransportError::Protocol(format!("unknown peer {}", peer)))?;

        let mut conn = client.conn.lock().await;
        match tokio::time::timeout(
            self.rpc_timeout,
            Self::round_trip(&client.addr, &mut conn, &request),
        )
        .await
        {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                slog::debug!(self.logger, "peer call failed"; "peer" => peer, "error" => %e);
                *conn = Conn::Disconnected;
                Err(TransportError::Unreachable(e.to_string()))
            }
            Err(_) => {
                // The stream may hold half a reply now; never reuse it.
                *conn = Conn::Disconnected;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn round_trip(
        addr: &str,
        conn: &mut Conn,
        request: &Request,
    ) -> io::Result<Response> {
        if let Conn::Disconnected = conn {
            *conn = Conn::Connected(TcpStream::connect(addr).await?);
        }
        let stream = match conn {
            Conn::Connected(stream) => stream,
            Conn::Disconnected => unreachable!("connected above"),
        };

        write_frame(stream, request).await?;
        read_frame(stream).await
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request_vote(
        &self,
        peer: ReplicaId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, TransportError> {
        match self.call(peer, Request::RequestVote(args)).await? {
            Response::RequestVote(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "unexpected reply to RequestVote: {:?}",
                other
            ))),
        }
    }

    async fn append_entries(
        &self,
        peer: ReplicaId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, TransportError> {
        match self.call(peer, Request::AppendEntries(args)).await? {
            Response::AppendEntries(reply) => Ok(reply),
            other => Err(TransportError::Protocol(format!(
                "unexpected reply to AppendEntries: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn transport_for(addr: &str, timeout: Duration) -> TcpTransport {
        let peer = Peer {
            id: 1,
            addr: addr.to_string(),
        };
        TcpTransport::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            std::slice::from_ref(&peer),
            timeout,
        )
    }

    fn vote_args() -> RequestVoteArgs {
        RequestVoteArgs {
            term: 1,
            candidate_id: 0,
            last_log_index: -1,
            last_log_term: -1,
        }
    }

    #[tokio::test]
    async fn round_trips_request_vote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: Request = read_frame(&mut stream).await.unwrap();
            match request {
                Request::RequestVote(args) => {
                    let reply = Response::RequestVote(RequestVoteReply {
                        term: args.term,
                        vote_granted: true,
                    });
                    write_frame(&mut stream, &reply).await.unwrap();
                }
                other => panic!("unexpected request: {:?}", other),
            }
        });

        let transport = transport_for(&addr, Duration::from_millis(500));
        let reply = transport.request_vote(1, vote_args()).await.unwrap();
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn unreachable_peer_reports_unreachable() {
        // Reserve a port and close it again so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = transport_for(&addr, Duration::from_millis(500));
        match transport.request_vote(1, vote_args()).await {
            Err(TransportError::Unreachable(_)) => {}
            other => panic!("expected Unreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Accept but never reply.
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport = transport_for(&addr, Duration::from_millis(50));
        assert_eq!(
            transport.request_vote(1, vote_args()).await,
            Err(TransportError::Timeout)
        );
    }

    #[tokio::test]
    async fn disconnect_reconnects_lazily() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Answer one request per accepted connection, forever.
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    while let Ok(Request::RequestVote(args)) = read_frame(&mut stream).await {
                        let reply = Response::RequestVote(RequestVoteReply {
                            term: args.term,
                            vote_granted: false,
                        });
                        if write_frame(&mut stream, &reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let transport = transport_for(&addr, Duration::from_millis(500));
        assert!(transport.request_vote(1, vote_args()).await.is_ok());

        transport.disconnect(1).await;
        assert!(
            transport.request_vote(1, vote_args()).await.is_ok(),
            "call after disconnect should reconnect"
        );
    }

    #[tokio::test]
    async fn unknown_peer_is_a_protocol_error() {
        let transport = transport_for("127.0.0.1:1", Duration::from_millis(50));
        match transport.request_vote(9, vote_args()).await {
            Err(TransportError::Protocol(_)) => {}
            other => panic!("expected Protocol error, got {:?}", other),
        }
    }
}
