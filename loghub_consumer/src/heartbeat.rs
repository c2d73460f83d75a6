//! Consumer group membership.
//!
//! A shard is claimed for as long as it is assigned by the consumer group, and beyond that
//! until its worker has stopped and the owner [released](Heartbeat::release) it. That way
//! the group never hands a shard to another consumer while this one may still write its
//! checkpoint.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::{self, ShardLeaseClient},
    model::ShardId,
};

#[derive(Debug, Default)]
struct LeaseState {
    /// The shards the consumer group assigned in its last answer.
    assigned: BTreeSet<ShardId>,
    /// The shards this consumer claims: everything assigned so far and not released yet.
    held: BTreeSet<ShardId>,
}

/// Periodic heartbeat against the consumer group.
#[derive(Debug)]
pub struct Heartbeat {
    client: Arc<dyn ShardLeaseClient>,
    interval: Duration,
    state: Mutex<LeaseState>,
}

impl Heartbeat {
    pub fn new(client: Arc<dyn ShardLeaseClient>, interval: Duration) -> Self {
        Self {
            client,
            interval,
            state: Default::default(),
        }
    }

    /// The shards assigned by the last successful heartbeat.
    pub fn assigned(&self) -> BTreeSet<ShardId> {
        self.state.lock().assigned.clone()
    }

    /// The shards currently claimed.
    pub fn held(&self) -> BTreeSet<ShardId> {
        self.state.lock().held.clone()
    }

    /// Stop claiming a shard whose worker stopped.
    ///
    /// Ignored, returning false, while the shard is still assigned.
    pub fn release(&self, shard: ShardId) -> bool {
        let mut state = self.state.lock();
        if state.assigned.contains(&shard) {
            return false;
        }
        let released = state.held.remove(&shard);
        if released {
            info!(shard_id=%shard, "released shard");
        }
        released
    }

    /// Send one heartbeat and record the answer.
    ///
    /// On error the last known assignment is kept.
    pub async fn beat(&self) -> client::Result<()> {
        let claimed = {
            let state = self.state.lock();
            state
                .held
                .union(&state.assigned)
                .copied()
                .collect::<Vec<_>>()
        };

        let answer = self.client.heartbeat(&claimed).await?;
        let assigned = answer.into_iter().collect::<BTreeSet<_>>();

        let mut state = self.state.lock();
        let added = assigned.difference(&state.assigned).copied().collect::<Vec<_>>();
        let revoked = state.assigned.difference(&assigned).copied().collect::<Vec<_>>();
        if !added.is_empty() {
            info!(shards=?added, "shards assigned by consumer group");
        }
        if !revoked.is_empty() {
            warn!(shards=?revoked, "shards revoked by consumer group");
        }
        debug!(?claimed, ?assigned, "heartbeat");

        state.held.extend(assigned.iter().copied());
        state.assigned = assigned;
        Ok(())
    }

    /// Beat every interval until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.beat().await {
                warn!(error=%e, "heartbeat failed, keeping last assignment");
            }
        }

        info!("heartbeat stopped");
    }
}
