//! The remote calls the consumer depends on.
//!
//! The wire client that talks to the log service lives outside this crate. It plugs in by
//! implementing [`LogStoreClient`] (data and checkpoint calls) and [`ShardLeaseClient`]
//! (consumer group membership).

use std::fmt::Debug;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::CursorPosition,
    model::{Cursor, PullResult, ShardId},
};

/// Failure of a remote call.
///
/// The consumer treats every variant as retryable, the variant only changes what gets
/// logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transient log store error: {message}")]
    Transient { message: String },

    #[error("shard {shard} is not owned by this consumer")]
    ShardNotOwned { shard: ShardId },

    #[error("invalid cursor: {cursor}")]
    InvalidCursor { cursor: Cursor },
}

impl Error {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Data plane and checkpoint calls against one logstore / consumer group.
#[async_trait]
pub trait LogStoreClient: Send + Sync + Debug + 'static {
    /// Pull the batch starting at `cursor`.
    ///
    /// When `query` is set the server filters the batch, and the returned meta carries the
    /// pre-filter size and count next to the delivered ones.
    async fn pull_logs(
        &self,
        shard: ShardId,
        cursor: &Cursor,
        query: Option<&str>,
    ) -> Result<PullResult>;

    /// Resolve a start position into a cursor.
    async fn get_cursor(&self, shard: ShardId, position: &CursorPosition) -> Result<Cursor>;

    /// Fetch the persisted checkpoint of the consumer group, if there is one.
    async fn get_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>>;

    /// Persist `cursor` as the checkpoint of the consumer group.
    async fn update_checkpoint(&self, shard: ShardId, cursor: &Cursor) -> Result<()>;
}

/// Consumer group membership.
#[async_trait]
pub trait ShardLeaseClient: Send + Sync + Debug + 'static {
    /// Report the shards this consumer holds and receive the shards the group assigns to it.
    async fn heartbeat(&self, held: &[ShardId]) -> Result<Vec<ShardId>>;
}
