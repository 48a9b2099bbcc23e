//! Wiring for one replica process: durable state, the consensus actor, the
//! apply loop, and the shared TCP listener, assembled from a `NodeConfig`.

use crate::actor::{ActorClient, FatalError, ReplicaActor};
use crate::apply::{ApplyProgress, ApplyTask, StoreHandle};
use crate::config::{ConfigError, NodeConfig};
use crate::gateway::Gateway;
use crate::replica::{ClusterView, NodeStatus, Peer, Replica, ReplicaConfig, Role};
use crate::store::{Album, AlbumStore};
use crate::storage::{FileStorage, Storage};
use crate::transport::{RpcServer, TcpTransport};
use crate::wire::DataMessage;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to open durable storage: {0}")]
    Storage(#[source] io::Error),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A running replica. Dropping the handle does not stop the process;
/// call `shutdown()` for an orderly exit.
pub struct Node {
    logger: slog::Logger,
    actor: ActorClient,
    gateway: Gateway,
    store: StoreHandle,
    status_rx: watch::Receiver<NodeStatus>,
    fatal_rx: oneshot::Receiver<FatalError>,
    server_task: tokio::task::JoinHandle<()>,
    apply_task: tokio::task::JoinHandle<()>,
}

impl Node {
    pub async fn start(logger: slog::Logger, config: NodeConfig) -> Result<Node, StartError> {
        config.validate()?;
        let me = config.my_id()?;
        let logger = logger.new(slog::o!("replica" => me));

        let mut storage =
            FileStorage::open(config.data_dir.join(format!("replica-{}", me)))
                .map_err(StartError::Storage)?;
        let durable = storage.load().map_err(StartError::Storage)?;

        // Bind before anything else so a taken port fails fast. Reuse-addr
        // lets a restarted replica reclaim its port while old connections
        // linger in TIME_WAIT.
        let listener = bind_listener(&config.listen_addr).map_err(|source| StartError::Bind {
            addr: config.listen_addr.clone(),
            source,
        })?;

        let peers: Vec<Peer> = config
            .peers()
            .into_iter()
            .map(|(id, addr)| Peer { id, addr })
            .collect();
        let cluster = ClusterView::new(me, config.listen_addr.clone(), peers);
        let transport = Arc::new(TcpTransport::new(
            logger.new(slog::o!("component" => "transport")),
            cluster.peers(),
            config.timing.rpc_timeout(),
        ));

        let (event_tx, event_rx) = mpsc::channel(256);
        let actor = ActorClient::new(event_tx);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(NodeStatus {
            role: Role::Follower,
            term: durable.current_term,
            leader_addr: None,
        });
        let (progress_tx, progress_rx) = watch::channel(ApplyProgress::none());
        let (applied_tx, _) = broadcast::channel(1024);

        // The store starts empty; committed entries flow back through the
        // apply loop as the cluster re-establishes its commit index.
        let store = StoreHandle::new(AlbumStore::new());
        let apply_task = tokio::spawn(
            ApplyTask::new(
                logger.new(slog::o!("component" => "apply")),
                apply_rx,
                store.clone(),
                progress_tx,
                applied_tx.clone(),
            )
            .run(),
        );

        let replica = Replica::new(ReplicaConfig {
            logger: logger.new(slog::o!("component" => "replica")),
            cluster,
            storage,
            transport,
            timing: config.timing.clone(),
            actor_client: actor.clone(),
            durable,
            apply_tx,
            status_tx,
        });

        let (fatal_tx, fatal_rx) = oneshot::channel();
        let actor_logger = logger.new(slog::o!("component" => "actor"));
        let replica_actor = ReplicaActor::new(actor_logger, event_rx, replica);
        tokio::spawn(async move {
            if let Err(fatal) = replica_actor.run().await {
                let _ = fatal_tx.send(fatal);
            }
        });

        let gateway = Gateway::new(
            logger.new(slog::o!("component" => "gateway")),
            actor.clone(),
            store.clone(),
            status_rx.clone(),
            progress_rx,
            applied_tx,
        );

        let server = RpcServer::new(
            logger.new(slog::o!("component" => "server")),
            actor.clone(),
            gateway.clone(),
        );
        let server_task = tokio::spawn(server.run(listener));

        slog::info!(logger, "node started"; "listen" => %config.listen_addr);

        Ok(Node {
            logger,
            actor,
            gateway,
            store,
            status_rx,
            fatal_rx,
            server_task,
            apply_task,
        })
    }

    /// Handles a data-plane message as if it had arrived over the wire.
    pub async fn handle_data(&self, message: DataMessage) -> DataMessage {
        self.gateway.handle(message).await
    }

    pub fn status(&self) -> NodeStatus {
        self.status_rx.borrow().clone()
    }

    /// This replica's current view of the album table. Eventually
    /// consistent: use the data-plane client for linearizable reads.
    pub fn local_albums(&self) -> Vec<Album> {
        self.store.get_all()
    }

    /// Resolves only if the replica dies of a storage failure; the process
    /// should then exit non-zero.
    pub async fn fatal(&mut self) -> FatalError {
        match (&mut self.fatal_rx).await {
            Ok(fatal) => fatal,
            // The actor exited cleanly; park forever, shutdown is driven
            // elsewhere.
            Err(_) => std::future::pending().await,
        }
    }

    pub async fn shutdown(self) {
        slog::info!(self.logger, "shutting down");
        self.actor.shutdown().await;
        self.server_task.abort();
        self.apply_task.abort();
    }
}

fn bind_listener(addr: &str) -> io::Result<TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}
