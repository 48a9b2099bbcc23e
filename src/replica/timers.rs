use crate::actor::ActorClient;
use crate::types::{ReplicaId, Term};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Election countdown for followers and candidates. Each reset re-arms the
/// timer with a fresh randomized timeout; if the deadline passes without a
/// reset, the timer fires a single election-timeout event and exits. Role
/// transitions drop the handle, which silently cancels the pending timeout.
pub struct FollowerTimerHandle {
    // flume rather than tokio mpsc: the timer task needs a non-blocking
    // try_recv to distinguish "deadline moved" from "deadline passed".
    wake_time_queue: flume::Sender<Instant>,
    timeout_range: RangeInclusive<Duration>,
}

impl FollowerTimerHandle {
    pub fn spawn(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: ActorClient,
    ) -> Self {
        let (tx, rx) = flume::unbounded();

        let handle = FollowerTimerHandle {
            wake_time_queue: tx,
            timeout_range: RangeInclusive::new(min_timeout, max_timeout),
        };
        handle.reset_timeout();

        tokio::spawn(Self::run(rx, actor_client));

        handle
    }

    pub fn reset_timeout(&self) {
        // The task only stops listening once this handle is dropped, so the
        // send can only fail during a role transition; nothing to do then.
        let _ = self.wake_time_queue.try_send(self.random_wake_time());
    }

    fn random_wake_time(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        Instant::now() + timeout
    }

    async fn run(queue: flume::Receiver<Instant>, actor_client: ActorClient) {
        loop {
            match queue.try_recv() {
                Ok(wake_time) => {
                    // Heard from the leader (or a candidate we voted for):
                    // sleep toward the pushed-out deadline.
                    tokio::time::sleep_until(wake_time).await;
                }
                Err(flume::TryRecvError::Empty) => {
                    // Slept to the deadline and nobody re-armed us.
                    actor_client.election_timeout().await;
                    return;
                }
                Err(flume::TryRecvError::Disconnected) => {
                    // Role changed; this timer no longer speaks for anyone.
                    return;
                }
            }
        }
    }
}

/// Periodic append-entries trigger for one `(peer, term)` pair. The task
/// fires immediately on spawn so a fresh leader announces itself without
/// waiting a full heartbeat interval, then keeps ticking until the handle is
/// dropped (step-down or shutdown) or the replica event loop goes away.
pub struct LeaderTimerHandle {
    _alive: Arc<()>,
}

impl LeaderTimerHandle {
    pub fn spawn(
        interval: Duration,
        actor_client: ActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) -> Self {
        let alive = Arc::new(());
        tokio::spawn(Self::run(
            Arc::downgrade(&alive),
            interval,
            actor_client,
            peer_id,
            term,
        ));
        LeaderTimerHandle { _alive: alive }
    }

    async fn run(
        alive: Weak<()>,
        interval: Duration,
        actor_client: ActorClient,
        peer_id: ReplicaId,
        term: Term,
    ) {
        loop {
            if alive.upgrade().is_none() {
                return;
            }
            if !actor_client.leader_tick(peer_id, term).await {
                return;
            }
            tokio::time::sleep(interval).await;
        }
    }
}
