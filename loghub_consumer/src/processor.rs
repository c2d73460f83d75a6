//! The user supplied side of consumption.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    checkpoint::CheckpointTracker,
    model::{Cursor, LogGroupList, ShardId},
    unwind::CaughtPanic,
};

/// Failure of a [`Processor`] call.
///
/// A processor may attach a rollback cursor to an error, in which case the worker resumes
/// from that cursor instead of retrying the batch.
#[derive(Debug, Error)]
#[error("processor failed: {source}")]
pub struct ProcessError {
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
    rollback: Option<Cursor>,
}

impl ProcessError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
            rollback: None,
        }
    }

    /// Request that consumption resumes from `cursor`.
    pub fn with_rollback(mut self, cursor: Cursor) -> Self {
        self.rollback = Some(cursor);
        self
    }

    pub fn rollback(&self) -> Option<&Cursor> {
        self.rollback.as_ref()
    }

    pub(crate) fn from_panic(panic: &CaughtPanic) -> Self {
        Self::new(format!("panic in process: {}", panic.message))
    }
}

/// Consumes the batches of one shard.
///
/// A processor instance is created per shard and only ever driven by that shard's worker,
/// one call at a time.
#[async_trait]
pub trait Processor: Send + Debug + 'static {
    /// Handle one batch.
    ///
    /// `Ok(None)` advances past the batch, `Ok(Some(cursor))` makes the next fetch start at
    /// `cursor`. On error the same batch is handed in again after a short delay, unless the
    /// error carries a rollback cursor or the worker is shutting down.
    async fn process(
        &mut self,
        shard: ShardId,
        log_groups: &LogGroupList,
        tracker: &mut dyn CheckpointTracker,
    ) -> Result<Option<Cursor>, ProcessError>;

    /// Called once when the worker stops, before its final checkpoint flush.
    ///
    /// Retried until it succeeds.
    async fn shutdown(&mut self, tracker: &mut dyn CheckpointTracker) -> Result<(), ProcessError>;
}

/// Creates the processor of a newly owned shard.
pub trait ProcessorFactory: Send + Sync + 'static {
    fn create(&self, shard: ShardId) -> Box<dyn Processor>;
}

impl<F> ProcessorFactory for F
where
    F: Fn(ShardId) -> Box<dyn Processor> + Send + Sync + 'static,
{
    fn create(&self, shard: ShardId) -> Box<dyn Processor> {
        self(shard)
    }
}

/// Signature of the closure wrapped by [`FnProcessor`].
pub type ProcessFn = dyn Fn(
        ShardId,
        &LogGroupList,
        &mut dyn CheckpointTracker,
    ) -> Result<Option<Cursor>, ProcessError>
    + Send
    + Sync;

/// A [`Processor`] made from a plain function, for consumers without per-shard state.
///
/// The function cannot await, so every batch it accepts (returns `Ok(None)` for) is saved
/// as the checkpoint on its behalf, to be persisted by the periodic or final flush. The
/// shutdown hook does nothing. It doubles as the [`ProcessorFactory`] handing a clone to
/// every shard.
#[derive(Clone)]
pub struct FnProcessor {
    f: Arc<ProcessFn>,
}

impl FnProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(
                ShardId,
                &LogGroupList,
                &mut dyn CheckpointTracker,
            ) -> Result<Option<Cursor>, ProcessError>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Arc::new(f) }
    }
}

impl Debug for FnProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnProcessor").finish_non_exhaustive()
    }
}

#[async_trait]
impl Processor for FnProcessor {
    async fn process(
        &mut self,
        shard: ShardId,
        log_groups: &LogGroupList,
        tracker: &mut dyn CheckpointTracker,
    ) -> Result<Option<Cursor>, ProcessError> {
        let rollback = (self.f)(shard, log_groups, tracker)?;
        if rollback.is_none() {
            tracker
                .save_checkpoint(false)
                .await
                .map_err(ProcessError::new)?;
        }
        Ok(rollback)
    }

    async fn shutdown(&mut self, _tracker: &mut dyn CheckpointTracker) -> Result<(), ProcessError> {
        Ok(())
    }
}

impl ProcessorFactory for FnProcessor {
    fn create(&self, _shard: ShardId) -> Box<dyn Processor> {
        Box::new(self.clone())
    }
}
