//! In-memory log store for tests.
//!
//! Cursors are decimal offsets into the list of log groups of a shard. Errors can be queued
//! per remote call and are returned, in order, before the call succeeds again.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    client::{self, LogStoreClient, ShardLeaseClient},
    config::CursorPosition,
    model::{Cursor, LogGroup, LogGroupList, PullMeta, PullResult, ShardId},
};

/// The remote calls of [`MockLogStore`], used to target injected errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MockCall {
    Pull,
    GetCursor,
    GetCheckpoint,
    UpdateCheckpoint,
    Heartbeat,
}

#[derive(Debug)]
struct State {
    shards: BTreeMap<ShardId, Vec<LogGroup>>,
    checkpoints: BTreeMap<ShardId, Cursor>,
    checkpoint_writes: Vec<(ShardId, Cursor)>,
    pulls: Vec<(ShardId, Cursor)>,
    errors: BTreeMap<MockCall, VecDeque<client::Error>>,

    /// Log groups returned per pull.
    batch_size: usize,
    pull_delay: Option<Duration>,
    in_flight_pulls: usize,
    peak_in_flight_pulls: usize,

    assignment: Vec<ShardId>,
    heartbeats: Vec<Vec<ShardId>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            shards: Default::default(),
            checkpoints: Default::default(),
            checkpoint_writes: Default::default(),
            pulls: Default::default(),
            errors: Default::default(),
            batch_size: 10,
            pull_delay: None,
            in_flight_pulls: 0,
            peak_in_flight_pulls: 0,
            assignment: Default::default(),
            heartbeats: Default::default(),
        }
    }
}

impl State {
    fn take_error(&mut self, call: MockCall) -> client::Result<()> {
        match self.errors.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A log store and consumer group coordinator held in memory.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockLogStore {
    state: Arc<Mutex<State>>,
}

impl MockLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how many log groups a pull returns at most.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        assert!(batch_size > 0, "batch size must be non-zero");
        self.state.lock().batch_size = batch_size;
        self
    }

    /// Make every pull take `delay`.
    pub fn with_pull_delay(self, delay: Duration) -> Self {
        self.state.lock().pull_delay = Some(delay);
        self
    }

    /// Create an empty shard.
    pub fn add_shard(&self, shard: ShardId) {
        self.state.lock().shards.entry(shard).or_default();
    }

    /// Append log groups to a shard, creating it if needed.
    pub fn append(&self, shard: ShardId, groups: impl IntoIterator<Item = LogGroup>) {
        self.state
            .lock()
            .shards
            .entry(shard)
            .or_default()
            .extend(groups);
    }

    /// Number of log groups in a shard.
    pub fn shard_len(&self, shard: ShardId) -> usize {
        self.state.lock().shards.get(&shard).map_or(0, Vec::len)
    }

    /// Seed a persisted checkpoint.
    pub fn set_checkpoint(&self, shard: ShardId, cursor: Cursor) {
        self.state.lock().checkpoints.insert(shard, cursor);
    }

    pub fn checkpoint(&self, shard: ShardId) -> Option<Cursor> {
        self.state.lock().checkpoints.get(&shard).cloned()
    }

    /// Every successful checkpoint update, in order.
    pub fn checkpoint_writes(&self) -> Vec<(ShardId, Cursor)> {
        self.state.lock().checkpoint_writes.clone()
    }

    /// The cursors of every pull of `shard` that reached the store, in order.
    pub fn pulls(&self, shard: ShardId) -> Vec<Cursor> {
        self.state
            .lock()
            .pulls
            .iter()
            .filter(|(s, _)| *s == shard)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Highest number of pulls observed in flight at the same time.
    pub fn peak_in_flight_pulls(&self) -> usize {
        self.state.lock().peak_in_flight_pulls
    }

    /// Queue an error for the next invocation of `call`.
    pub fn push_error(&self, call: MockCall, error: client::Error) {
        self.state
            .lock()
            .errors
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Set the shards the consumer group assigns on the next heartbeats.
    pub fn assign(&self, shards: impl IntoIterator<Item = ShardId>) {
        self.state.lock().assignment = shards.into_iter().collect();
    }

    /// The `held` argument of every successful heartbeat, in order.
    pub fn heartbeats(&self) -> Vec<Vec<ShardId>> {
        self.state.lock().heartbeats.clone()
    }

    fn offset(cursor: &Cursor, len: usize) -> client::Result<usize> {
        match cursor.as_str().parse::<usize>() {
            Ok(offset) if offset <= len => Ok(offset),
            _ => Err(client::Error::InvalidCursor {
                cursor: cursor.clone(),
            }),
        }
    }

    fn pull_from(
        &self,
        shard: ShardId,
        cursor: &Cursor,
        query: Option<&str>,
    ) -> client::Result<PullResult> {
        let mut state = self.state.lock();
        state.take_error(MockCall::Pull)?;
        state.pulls.push((shard, cursor.clone()));

        let batch_size = state.batch_size;
        let groups = state
            .shards
            .get(&shard)
            .ok_or_else(|| client::Error::transient(format!("unknown shard {shard}")))?;
        let start = Self::offset(cursor, groups.len())?;
        let end = (start + batch_size).min(groups.len());

        let scanned = groups[start..end]
            .iter()
            .enumerate()
            .map(|(i, g)| LogGroup {
                cursor: Some(Cursor::new((start + i).to_string())),
                ..g.clone()
            })
            .collect::<Vec<_>>();
        let scanned_size = scanned.iter().map(LogGroup::payload_size).sum::<usize>();
        let scanned_count = scanned.len();

        let delivered = match query {
            Some(q) => scanned
                .into_iter()
                .filter(|g| {
                    g.logs
                        .iter()
                        .flat_map(|l| l.contents.iter())
                        .any(|c| c.value.contains(q))
                })
                .collect::<Vec<_>>(),
            None => scanned,
        };

        Ok(PullResult {
            meta: PullMeta {
                next_cursor: Cursor::new(end.to_string()),
                raw_size: delivered.iter().map(LogGroup::payload_size).sum(),
                count: delivered.len(),
                raw_size_before_query: scanned_size,
                count_before_query: scanned_count,
            },
            log_groups: LogGroupList {
                log_groups: delivered,
            },
        })
    }
}

#[async_trait]
impl LogStoreClient for MockLogStore {
    async fn pull_logs(
        &self,
        shard: ShardId,
        cursor: &Cursor,
        query: Option<&str>,
    ) -> client::Result<PullResult> {
        let delay = {
            let mut state = self.state.lock();
            state.in_flight_pulls += 1;
            state.peak_in_flight_pulls = state.peak_in_flight_pulls.max(state.in_flight_pulls);
            state.pull_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.pull_from(shard, cursor, query);
        self.state.lock().in_flight_pulls -= 1;
        result
    }

    async fn get_cursor(
        &self,
        shard: ShardId,
        position: &CursorPosition,
    ) -> client::Result<Cursor> {
        let mut state = self.state.lock();
        state.take_error(MockCall::GetCursor)?;

        let groups = state
            .shards
            .get(&shard)
            .ok_or_else(|| client::Error::transient(format!("unknown shard {shard}")))?;
        let offset = match position {
            CursorPosition::Begin => 0,
            CursorPosition::End => groups.len(),
            CursorPosition::Timestamp(ts) => groups
                .iter()
                .position(|g| g.logs.iter().any(|l| i64::from(l.time) >= *ts))
                .unwrap_or(groups.len()),
        };
        Ok(Cursor::new(offset.to_string()))
    }

    async fn get_checkpoint(&self, shard: ShardId) -> client::Result<Option<Cursor>> {
        let mut state = self.state.lock();
        state.take_error(MockCall::GetCheckpoint)?;
        Ok(state.checkpoints.get(&shard).cloned())
    }

    async fn update_checkpoint(&self, shard: ShardId, cursor: &Cursor) -> client::Result<()> {
        let mut state = self.state.lock();
        state.take_error(MockCall::UpdateCheckpoint)?;
        state.checkpoints.insert(shard, cursor.clone());
        state.checkpoint_writes.push((shard, cursor.clone()));
        Ok(())
    }
}

#[async_trait]
impl ShardLeaseClient for MockLogStore {
    async fn heartbeat(&self, held: &[ShardId]) -> client::Result<Vec<ShardId>> {
        let mut state = self.state.lock();
        state.take_error(MockCall::Heartbeat)?;
        state.heartbeats.push(held.to_vec());
        let assignment = state.assignment.iter().copied().collect::<BTreeSet<_>>();
        Ok(assignment.into_iter().collect())
    }
}
