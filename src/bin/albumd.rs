//! Replica daemon: one `albumd` process per cluster member.
//!
//! ```text
//! albumd --listen 127.0.0.1:7000 \
//!        --peers 127.0.0.1:7000,127.0.0.1:7001,127.0.0.1:7002 \
//!        --data-dir ./data
//! ```
//!
//! `--peers` is the full ordered member list, identical on every replica;
//! a replica's id is the position of its own listen address in the list.

use album_raft::{Node, NodeConfig, TimingOptions};
use clap::Parser;
use slog::Drain;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "albumd", about = "Replicated album store backend")]
struct Args {
    /// Address this replica listens on (peer RPCs and data plane).
    #[arg(long)]
    listen: String,

    /// Full ordered cluster member list, including this replica.
    #[arg(long, value_delimiter = ',', required = true)]
    peers: Vec<String>,

    /// Directory for durable state (term, vote, log).
    #[arg(long, default_value = "./albumd-data")]
    data_dir: PathBuf,

    /// Lower bound of the randomized election timeout, in milliseconds.
    #[arg(long, default_value_t = 100)]
    election_timeout_min_ms: u64,

    /// Upper bound of the randomized election timeout, in milliseconds.
    #[arg(long, default_value_t = 200)]
    election_timeout_max_ms: u64,

    /// Leader heartbeat interval, in milliseconds.
    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let logger = term_logger();

    let config = NodeConfig {
        listen_addr: args.listen,
        members: args.peers,
        data_dir: args.data_dir,
        timing: TimingOptions {
            election_timeout_min: Duration::from_millis(args.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(args.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
        },
    };

    let mut node = match Node::start(logger.clone(), config).await {
        Ok(node) => node,
        Err(e) => {
            slog::crit!(logger, "failed to start"; "error" => %e);
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            slog::info!(logger, "interrupted");
        }
        fatal = node.fatal() => {
            slog::crit!(logger, "replica died"; "error" => %fatal);
            std::process::exit(1);
        }
    }

    node.shutdown().await;
}

fn term_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
