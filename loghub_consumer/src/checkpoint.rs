//! Tracking and persisting the consumption progress of a shard.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    client::{self, LogStoreClient},
    model::{Cursor, ShardId},
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to persist checkpoint {cursor} of shard {shard}: {source}")]
    Flush {
        shard: ShardId,
        cursor: Cursor,
        #[source]
        source: client::Error,
    },
}

/// The checkpoint operations available to a [`Processor`](crate::processor::Processor).
#[async_trait]
pub trait CheckpointTracker: Send + Sync + Debug {
    /// Mark the end of the batch being processed as the checkpoint to persist.
    ///
    /// With `force` the checkpoint is persisted before returning, otherwise it is persisted
    /// by the next periodic flush (unless auto commit is disabled) or at shutdown.
    async fn save_checkpoint(&mut self, force: bool) -> Result<(), CheckpointError>;

    /// The cursor the batch being processed was fetched from.
    fn current_cursor(&self) -> &Cursor;
}

/// Checkpoint state of one shard.
///
/// Owned by the shard's worker and lent to the processor on the same task, never shared
/// between tasks.
#[derive(Debug)]
pub struct DefaultCheckpointTracker {
    client: Arc<dyn LogStoreClient>,
    shard: ShardId,

    /// Cursor of the batch currently being processed.
    current_cursor: Cursor,
    /// Cursor after the batch currently being processed.
    next_cursor: Cursor,
    /// Cursor saved by the processor, waiting to be persisted.
    pending: Option<Cursor>,
    /// Last cursor known to be persisted in the log store.
    persisted: Option<Cursor>,
}

impl DefaultCheckpointTracker {
    pub fn new(shard: ShardId, client: Arc<dyn LogStoreClient>) -> Self {
        Self {
            client,
            shard,
            current_cursor: Cursor::default(),
            next_cursor: Cursor::default(),
            pending: None,
            persisted: None,
        }
    }

    /// Seed the tracker with the checkpoint found in the log store at startup.
    pub fn init_checkpoint(&mut self, cursor: Cursor) {
        self.persisted = Some(cursor);
    }

    pub fn set_current_cursor(&mut self, cursor: Cursor) {
        self.current_cursor = cursor;
    }

    pub fn set_next_cursor(&mut self, cursor: Cursor) {
        self.next_cursor = cursor;
    }

    pub fn next_cursor(&self) -> &Cursor {
        &self.next_cursor
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Whether a saved checkpoint has not been persisted yet.
    pub fn is_dirty(&self) -> bool {
        match &self.pending {
            Some(pending) => self.persisted.as_ref() != Some(pending),
            None => false,
        }
    }

    pub fn persisted_checkpoint(&self) -> Option<&Cursor> {
        self.persisted.as_ref()
    }

    /// Persist the saved checkpoint if it changed since the last flush.
    ///
    /// A clean tracker does not touch the log store. On failure the tracker stays dirty and
    /// the caller decides when to try again.
    pub async fn flush_checkpoint(&mut self) -> Result<(), CheckpointError> {
        if !self.is_dirty() {
            return Ok(());
        }
        let Some(cursor) = self.pending.clone() else {
            return Ok(());
        };

        match self.client.update_checkpoint(self.shard, &cursor).await {
            Ok(()) => {
                debug!(shard_id=%self.shard, %cursor, "checkpoint persisted");
                self.persisted = Some(cursor);
                Ok(())
            }
            Err(source) => {
                if let client::Error::ShardNotOwned { .. } = &source {
                    warn!(
                        shard_id=%self.shard,
                        %cursor,
                        "consumer group moved the shard away, checkpoint rejected"
                    );
                }
                Err(CheckpointError::Flush {
                    shard: self.shard,
                    cursor,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl CheckpointTracker for DefaultCheckpointTracker {
    async fn save_checkpoint(&mut self, force: bool) -> Result<(), CheckpointError> {
        self.pending = Some(self.next_cursor.clone());
        if force {
            return self.flush_checkpoint().await;
        }
        Ok(())
    }

    fn current_cursor(&self) -> &Cursor {
        &self.current_cursor
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::mock::{MockCall, MockLogStore};

    const SHARD: ShardId = ShardId::new(0);

    fn tracker(store: &MockLogStore) -> DefaultCheckpointTracker {
        DefaultCheckpointTracker::new(SHARD, Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn clean_flush_is_a_noop() {
        let store = MockLogStore::new();
        let mut tracker = tracker(&store);

        assert!(!tracker.is_dirty());
        tracker.flush_checkpoint().await.unwrap();
        assert!(store.checkpoint_writes().is_empty());
    }

    #[tokio::test]
    async fn flush_writes_once_per_save() {
        let store = MockLogStore::new();
        let mut tracker = tracker(&store);

        tracker.set_current_cursor(Cursor::from("10"));
        tracker.set_next_cursor(Cursor::from("20"));
        assert_eq!(tracker.shard(), SHARD);
        assert_eq!(tracker.next_cursor(), &Cursor::from("20"));
        tracker.save_checkpoint(false).await.unwrap();
        assert!(tracker.is_dirty());

        tracker.flush_checkpoint().await.unwrap();
        tracker.flush_checkpoint().await.unwrap();
        tracker.flush_checkpoint().await.unwrap();

        assert_eq!(store.checkpoint_writes(), vec![(SHARD, Cursor::from("20"))]);
        assert_eq!(store.checkpoint(SHARD), Some(Cursor::from("20")));
        assert_eq!(tracker.persisted_checkpoint(), Some(&Cursor::from("20")));
        assert!(!tracker.is_dirty());
    }

    #[tokio::test]
    async fn force_save_flushes_immediately() {
        let store = MockLogStore::new();
        let mut tracker = tracker(&store);

        tracker.set_next_cursor(Cursor::from("7"));
        tracker.save_checkpoint(true).await.unwrap();

        assert_eq!(store.checkpoint_writes(), vec![(SHARD, Cursor::from("7"))]);
        assert!(!tracker.is_dirty());
    }

    #[tokio::test]
    async fn saving_the_persisted_cursor_is_clean() {
        let store = MockLogStore::new();
        let mut tracker = tracker(&store);

        tracker.init_checkpoint(Cursor::from("5"));
        tracker.set_next_cursor(Cursor::from("5"));
        tracker.save_checkpoint(false).await.unwrap();

        assert!(!tracker.is_dirty());
        tracker.flush_checkpoint().await.unwrap();
        assert!(store.checkpoint_writes().is_empty());
    }

    #[tokio::test]
    async fn failed_flush_stays_dirty() {
        let store = MockLogStore::new();
        store.push_error(MockCall::UpdateCheckpoint, client::Error::transient("boom"));
        let mut tracker = tracker(&store);

        tracker.set_next_cursor(Cursor::from("3"));
        tracker.save_checkpoint(false).await.unwrap();

        let err = tracker.flush_checkpoint().await.unwrap_err();
        assert_matches!(err, CheckpointError::Flush { shard, cursor, .. } => {
            assert_eq!(shard, SHARD);
            assert_eq!(cursor, Cursor::from("3"));
        });
        assert!(tracker.is_dirty());

        tracker.flush_checkpoint().await.unwrap();
        assert_eq!(store.checkpoint(SHARD), Some(Cursor::from("3")));
    }

    #[tokio::test]
    async fn current_cursor_is_visible_to_processors() {
        let store = MockLogStore::new();
        let mut tracker = tracker(&store);
        tracker.set_current_cursor(Cursor::from("42"));

        let dyn_tracker: &mut dyn CheckpointTracker = &mut tracker;
        assert_eq!(dyn_tracker.current_cursor(), &Cursor::from("42"));
    }
}
