use crate::actor::ActorClient;
use crate::gateway::Gateway;
use crate::wire::{read_frame, write_frame, Request, Response};
use tokio::net::{TcpListener, TcpStream};

/// The shared listener of one replica: peers and frontends connect to the
/// same address, and the tagged envelope routes each frame to either the
/// consensus actor or the client gateway. Connections are request/reply
/// lockstep and live until the remote side hangs up.
pub struct RpcServer {
    logger: slog::Logger,
    actor: ActorClient,
    gateway: Gateway,
}

impl RpcServer {
    pub fn new(logger: slog::Logger, actor: ActorClient, gateway: Gateway) -> Self {
        RpcServer {
            logger,
            actor,
            gateway,
        }
    }

    pub async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let logger = self.logger.new(slog::o!("remote" => remote.to_string()));
                    let actor = self.actor.clone();
                    let gateway = self.gateway.clone();
                    tokio::spawn(async move {
                        Self::serve_connection(logger, actor, gateway, stream).await;
                    });
                }
                Err(e) => {
                    slog::warn!(self.logger, "accept failed"; "error" => %e);
                }
            }
        }
    }

    async fn serve_connection(
        logger: slog::Logger,
        actor: ActorClient,
        gateway: Gateway,
        mut stream: TcpStream,
    ) {
        loop {
            let request: Request = match read_frame(&mut stream).await {
                Ok(request) => request,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::UnexpectedEof {
                        slog::debug!(logger, "connection read failed"; "error" => %e);
                    }
                    return;
                }
            };

            let response = match request {
                Request::RequestVote(args) => match actor.request_vote(args).await {
                    Ok(reply) => Response::RequestVote(reply),
                    Err(_) => return, // replica has shut down
                },
                Request::AppendEntries(args) => match actor.append_entries(args).await {
                    Ok(reply) => Response::AppendEntries(reply),
                    Err(_) => return,
                },
                Request::Data(message) => Response::Data(gateway.handle(message).await),
            };

            if let Err(e) = write_frame(&mut stream, &response).await {
                slog::debug!(logger, "connection write failed"; "error" => %e);
                return;
            }
        }
    }
}
