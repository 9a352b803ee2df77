//! Bounded fan-out of discovery polls.
//!
//! Targets are grouped by relay so every relay is dialled once. Sessions
//! are acquired concurrently; as each one becomes available its clouds are
//! submitted to a worker pool. Results land on a lock-free queue in
//! completion order. The call returns when every target has reported or
//! the deadline passes, whichever comes first; targets still pending at
//! the deadline are reported as timeouts.

use super::poll::PollTask;
use super::pool::{PoolConfig, WorkerPool};
use crate::config::GatekeeperConfig;
use crate::model::{Cloud, PollFailure, PollRequest, PollResult, Relay};
use crossbeam_queue::SegQueue;
use skylink_relay::{RelayError, RelayKey, RelaySessionCache, SessionLease};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;

/// Results shared between poll jobs and the coordinator.
#[derive(Default)]
struct ResultQueue {
    results: SegQueue<(usize, PollResult)>,
    ready: Notify,
}

impl ResultQueue {
    fn push(&self, index: usize, result: PollResult) {
        self.results.push((index, result));
        self.ready.notify_one();
    }
}

struct RelayGroup {
    relay: Relay,
    targets: Vec<usize>,
}

/// Fans one discovery request out to many clouds.
pub struct FanoutCoordinator {
    cache: Arc<RelaySessionCache>,
    config: GatekeeperConfig,
}

impl FanoutCoordinator {
    /// Coordinator sharing `cache` with other components.
    #[must_use]
    pub fn new(cache: Arc<RelaySessionCache>, config: GatekeeperConfig) -> Self {
        Self { cache, config }
    }

    /// Poll every `(cloud, relay)` target within `deadline`.
    ///
    /// Returns exactly one result per target, in completion order.
    pub async fn poll(
        &self,
        targets: Vec<(Cloud, Relay)>,
        request: Arc<PollRequest>,
        deadline: Duration,
    ) -> Vec<PollResult> {
        let deadline_at = Instant::now() + deadline;
        let target_count = targets.len();
        if target_count == 0 {
            return Vec::new();
        }

        let groups = group_by_relay(&targets);
        tracing::info!(
            "Polling {} cloud(s) over {} relay(s) for '{}'",
            target_count,
            groups.len(),
            request.query.service_definition
        );

        let pool = WorkerPool::new(PoolConfig {
            num_workers: target_count.min(self.config.max_pool_size),
            queue_capacity: self.config.queue_capacity,
        });
        let queue = Arc::new(ResultQueue::default());

        let mut acquired = self.acquire_sessions(&groups);
        let mut awaiting_sessions = groups.len();
        let mut in_flight = 0usize;
        let mut leases: Vec<SessionLease> = Vec::with_capacity(groups.len());
        let mut reported = vec![false; target_count];
        let mut results = Vec::with_capacity(target_count);

        loop {
            while let Some((index, result)) = queue.results.pop() {
                if !reported[index] {
                    reported[index] = true;
                    results.push(result);
                    in_flight -= 1;
                }
            }
            if awaiting_sessions == 0 && in_flight == 0 {
                break;
            }

            tokio::select! {
                () = tokio::time::sleep_until(deadline_at) => break,
                Some((group, session)) = acquired.recv(), if awaiting_sessions > 0 => {
                    awaiting_sessions -= 1;
                    let group = &groups[group];
                    match session {
                        Ok(lease) => {
                            for &index in &group.targets {
                                let (cloud, _) = &targets[index];
                                let task = PollTask::new(
                                    Arc::clone(lease.session()),
                                    cloud,
                                    Arc::clone(&request),
                                    self.config.poll_timeout,
                                );
                                let queue = Arc::clone(&queue);
                                let submitted = pool.submit(async move {
                                    queue.push(index, task.run().await);
                                });
                                match submitted {
                                    Ok(()) => in_flight += 1,
                                    Err(e) => {
                                        tracing::warn!("Poll of {} not scheduled: {}", cloud.identity, e);
                                        reported[index] = true;
                                        results.push(PollResult::failure(
                                            cloud.identity.clone(),
                                            PollFailure::Rejected(e.to_string()),
                                        ));
                                    }
                                }
                            }
                            leases.push(lease);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Relay {} unreachable, failing {} cloud(s): {}",
                                group.relay.key(),
                                group.targets.len(),
                                e
                            );
                            for &index in &group.targets {
                                reported[index] = true;
                                results.push(PollResult::failure(
                                    targets[index].0.identity.clone(),
                                    PollFailure::RelayUnreachable(e.to_string()),
                                ));
                            }
                        }
                    }
                }
                () = queue.ready.notified() => {}
            }
        }

        let abandoned = reported.iter().filter(|done| !**done).count();
        if abandoned > 0 {
            tracing::warn!("Fan-out deadline reached with {} cloud(s) pending", abandoned);
        }
        for (index, done) in reported.iter().enumerate() {
            if !done {
                results.push(PollResult::failure(
                    targets[index].0.identity.clone(),
                    PollFailure::Timeout,
                ));
            }
        }

        // Abandoned jobs keep running on their own; their results are dropped.
        pool.close();
        for lease in leases {
            lease.release().await;
        }

        let successes = results.iter().filter(|r| r.is_success()).count();
        tracing::info!(
            "Fan-out finished: {} answered, {} failed",
            successes,
            results.len() - successes
        );
        results
    }

    /// Dial every relay concurrently. A session that arrives after the
    /// coordinator has returned is released by its dialling task.
    fn acquire_sessions(
        &self,
        groups: &[RelayGroup],
    ) -> mpsc::UnboundedReceiver<(usize, Result<SessionLease, RelayError>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        for (index, group) in groups.iter().enumerate() {
            let cache = Arc::clone(&self.cache);
            let relay = group.relay.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let session = cache
                    .get_or_create(&relay.address, relay.port, relay.secure)
                    .await;
                if let Err(mpsc::error::SendError((_, Ok(lease)))) = tx.send((index, session)) {
                    lease.release().await;
                }
            });
        }
        rx
    }
}

fn group_by_relay(targets: &[(Cloud, Relay)]) -> Vec<RelayGroup> {
    let mut by_key: HashMap<RelayKey, usize> = HashMap::new();
    let mut groups: Vec<RelayGroup> = Vec::new();

    for (index, (_, relay)) in targets.iter().enumerate() {
        let slot = *by_key.entry(relay.key()).or_insert_with(|| {
            groups.push(RelayGroup {
                relay: relay.clone(),
                targets: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].targets.push(index);
    }
    groups
}
