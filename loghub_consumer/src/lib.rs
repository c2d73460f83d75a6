//! Consumer group client engine for a sharded log store.
//!
//! A [`ShardOwner`] keeps a heartbeat with the consumer group and runs one
//! [`ShardConsumerWorker`] per assigned shard. Each worker repeatedly pulls a batch of log
//! groups, hands it to a user supplied [`Processor`] and keeps the shard's checkpoint through
//! a [`DefaultCheckpointTracker`].
//!
//! The wire client is not part of this crate, it plugs in through [`LogStoreClient`] and
//! [`ShardLeaseClient`]. [`mock::MockLogStore`] implements both in memory.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod mock;
pub mod model;
pub mod monitor;
pub mod owner;
pub mod processor;
pub mod throttle;
mod unwind;
pub mod worker;

pub use checkpoint::{CheckpointError, CheckpointTracker, DefaultCheckpointTracker};
pub use client::{LogStoreClient, ShardLeaseClient};
pub use config::{ConsumerConfig, CursorPosition};
pub use model::{Cursor, Log, LogContent, LogGroup, LogGroupList, PullMeta, PullResult, ShardId};
pub use owner::ShardOwner;
pub use processor::{FnProcessor, ProcessError, Processor, ProcessorFactory};
pub use worker::ShardConsumerWorker;
