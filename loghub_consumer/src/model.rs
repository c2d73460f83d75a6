//! Identifiers and the batch payload handed to processors.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Identifier of a shard, an independently ordered partition of a logstore.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct ShardId(u32);

impl ShardId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque position within a shard.
///
/// Cursors are only ever produced by the log store and compared for equality by the consumer.
/// The empty cursor stands for "no position".
#[derive(Debug, Clone, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(cursor: impl Into<String>) -> Self {
        Self(cursor.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Cursor {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for Cursor {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single key/value pair of a [`Log`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogContent {
    pub key: String,
    pub value: String,
}

impl LogContent {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Receive time, seconds since the unix epoch.
    pub time: u32,
    pub contents: Vec<LogContent>,
}

/// A group of logs that were written together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroup {
    pub topic: String,
    pub source: String,
    /// Cursor of this group within its shard, when the server returns one.
    ///
    /// Together with the shard and the index of a log inside the group this uniquely
    /// identifies a log, which makes it usable as an idempotency key.
    pub cursor: Option<Cursor>,
    pub logs: Vec<Log>,
}

impl LogGroup {
    /// Number of bytes of key/value payload in this group.
    pub fn payload_size(&self) -> usize {
        self.logs
            .iter()
            .flat_map(|log| log.contents.iter())
            .map(|c| c.key.len() + c.value.len())
            .sum()
    }
}

/// The batch of log groups returned by one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroupList {
    pub log_groups: Vec<LogGroup>,
}

impl LogGroupList {
    pub fn len(&self) -> usize {
        self.log_groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_groups.is_empty()
    }
}

/// Metadata of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullMeta {
    /// Where the next pull should start.
    pub next_cursor: Cursor,
    /// Size in bytes of the returned batch.
    pub raw_size: usize,
    /// Number of log groups in the returned batch.
    pub count: usize,
    /// Size of the scanned data before the server-side query filtered it.
    pub raw_size_before_query: usize,
    /// Number of scanned log groups before the server-side query filtered them.
    pub count_before_query: usize,
}

/// The result of pulling from a shard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullResult {
    pub log_groups: LogGroupList,
    pub meta: PullMeta,
}
