//! Consumption of a single shard.
//!
//! A [`ShardConsumerWorker`] drives one shard from its initial cursor to shutdown:
//!
//! ```text
//!   Starting ──► Running ──► ShuttingDown ──► Stopped
//! ```
//!
//! Nothing that goes wrong while running is fatal. Remote call failures, processor errors and
//! processor panics all turn into delayed retries, and a panic escaping the loop itself is
//! caught and turned into an orderly shutdown. Shutdown is cooperative: the flag is only
//! checked between steps, so an in-flight pull or sleep completes first.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::DefaultCheckpointTracker,
    client::LogStoreClient,
    config::ConsumerConfig,
    model::{Cursor, LogGroupList, PullMeta, PullResult, ShardId},
    monitor::{MetricsSnapshot, ShardMonitor},
    processor::{ProcessError, Processor},
    throttle::FetchThrottle,
    unwind::catch_async,
};

const INIT_CURSOR_RETRY_DELAY: Duration = Duration::from_millis(100);
const FETCH_FAILED_DELAY: Duration = Duration::from_millis(100);
const NO_PROGRESS_DELAY: Duration = Duration::from_millis(500);
const PROCESS_FAILED_DELAY: Duration = Duration::from_millis(50);
const SHUTDOWN_FAILED_DELAY: Duration = Duration::from_millis(100);
const FLUSH_CHECKPOINT_FAILED_DELAY: Duration = Duration::from_millis(100);

const MIB: usize = 1024 * 1024;

/// Batches at least this large are followed by an immediate fetch.
const LARGE_BATCH_RAW_SIZE: usize = 4 * MIB;

/// How long to wait before the next fetch of a shard.
///
/// Quiet shards are slowed down to at most one fetch per 500ms, moderately busy ones to one
/// per 200ms or 50ms, while shards returning large batches (or whose last fetch alone took
/// longer than the configured fetch interval) are fetched back to back. When a query is
/// configured the pre-filter size and count decide, since they reflect how much data the
/// shard actually has.
pub fn pacing_delay(
    since_last_fetch: Duration,
    meta: &PullMeta,
    config: &ConsumerConfig,
) -> Duration {
    if since_last_fetch > config.data_fetch_interval {
        return Duration::ZERO;
    }

    let (raw_size, count) = match config.query() {
        Some(_) => (meta.raw_size_before_query, meta.count_before_query),
        None => (meta.raw_size, meta.count),
    };

    if count >= config.max_fetch_log_group_count || raw_size >= LARGE_BATCH_RAW_SIZE {
        return Duration::ZERO;
    }

    let target = if count < 100 && raw_size < MIB {
        Duration::from_millis(500)
    } else if count < 500 && raw_size < 2 * MIB {
        Duration::from_millis(200)
    } else {
        Duration::from_millis(50)
    };
    target.saturating_sub(since_last_fetch)
}

/// Handle to the worker consuming one shard.
#[derive(Debug)]
pub struct ShardConsumerWorker {
    shard: ShardId,
    shutdown: CancellationToken,
    stopped: Arc<AtomicBool>,
    monitor: Arc<ShardMonitor>,
    metrics_disabled: bool,

    /// The not yet started task. Taken exactly once by [`Self::ensure_started`].
    task: Mutex<Option<ShardTask>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShardConsumerWorker {
    pub fn new(
        shard: ShardId,
        config: Arc<ConsumerConfig>,
        client: Arc<dyn LogStoreClient>,
        processor: Box<dyn Processor>,
        throttle: FetchThrottle,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let stopped = Arc::new(AtomicBool::new(false));
        let monitor = Arc::new(ShardMonitor::new(shard, config.metrics_report_interval));

        let task = ShardTask {
            shard,
            tracker: DefaultCheckpointTracker::new(shard, Arc::clone(&client)),
            config: Arc::clone(&config),
            client,
            processor,
            monitor: Arc::clone(&monitor),
            throttle,
            shutdown: shutdown.clone(),
            stopped: Arc::clone(&stopped),
            last_checkpoint_flush: Instant::now(),
        };

        Self {
            shard,
            shutdown,
            stopped,
            monitor,
            metrics_disabled: config.disable_runtime_metrics,
            task: Mutex::new(Some(task)),
            handle: Mutex::new(None),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Spawn the consumption task on the current tokio runtime. Calling it again is a no-op.
    pub fn ensure_started(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        *self.handle.lock() = Some(tokio::spawn(task.run()));
    }

    /// Ask the worker to stop after its current step.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(shard_id=%self.shard, "shard worker shutdown requested");
        }
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// True once the shutdown hook ran and the final checkpoint was persisted.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait for the consumption task to finish.
    ///
    /// Returns immediately if the worker was never started.
    pub async fn join(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if let Err(e) = handle.await {
            error!(shard_id=%self.shard, error=%e, "shard worker task failed");
        }
    }

    pub fn monitor(&self) -> &Arc<ShardMonitor> {
        &self.monitor
    }

    pub fn should_report_metrics(&self) -> bool {
        !self.metrics_disabled && self.monitor.should_report()
    }

    pub fn report_metrics(&self) -> MetricsSnapshot {
        self.monitor.report()
    }
}

/// The state owned by the consumption task.
#[derive(Debug)]
struct ShardTask {
    shard: ShardId,
    config: Arc<ConsumerConfig>,
    client: Arc<dyn LogStoreClient>,
    processor: Box<dyn Processor>,
    tracker: DefaultCheckpointTracker,
    monitor: Arc<ShardMonitor>,
    throttle: FetchThrottle,
    shutdown: CancellationToken,
    stopped: Arc<AtomicBool>,
    last_checkpoint_flush: Instant,
}

impl ShardTask {
    async fn run(mut self) {
        info!(shard_id=%self.shard, "shard worker started");

        if let Err(panic) = catch_async(self.run_loop()).await {
            error!(
                shard_id=%self.shard,
                panic=%panic.message,
                backtrace=%panic.backtrace,
                "panic in shard worker loop, shutting down"
            );
            self.shutdown.cancel();
        }

        self.shutdown_gracefully().await;
    }

    async fn run_loop(&mut self) {
        let Some(mut cursor) = self.initial_cursor().await else {
            return;
        };
        info!(shard_id=%self.shard, %cursor, "shard worker got initial cursor");

        while !self.shutdown.is_cancelled() {
            let fetch_started = Instant::now();
            let Some(PullResult { log_groups, meta }) = self.fetch(&cursor).await else {
                continue;
            };

            cursor = self.process(&log_groups, &meta).await;
            self.tracker.set_current_cursor(cursor.clone());
            if self.shutdown.is_cancelled() {
                break;
            }

            let delay = pacing_delay(fetch_started.elapsed(), &meta, &self.config);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Resolve where to start, retrying until it works or shutdown is requested.
    async fn initial_cursor(&mut self) -> Option<Cursor> {
        while !self.shutdown.is_cancelled() {
            match self.resolve_initial_cursor().await {
                Ok(cursor) => return Some(cursor),
                Err(e) => {
                    warn!(shard_id=%self.shard, error=%e, "failed to get initial cursor");
                    tokio::time::sleep(INIT_CURSOR_RETRY_DELAY).await;
                }
            }
        }
        None
    }

    async fn resolve_initial_cursor(&mut self) -> crate::client::Result<Cursor> {
        let checkpoint = self
            .client
            .get_checkpoint(self.shard)
            .await?
            .filter(|c| !c.is_empty());
        if let Some(checkpoint) = checkpoint {
            self.tracker.init_checkpoint(checkpoint.clone());
            return Ok(checkpoint);
        }
        self.client
            .get_cursor(self.shard, &self.config.cursor_position)
            .await
    }

    /// Pull the batch at `cursor`.
    ///
    /// Returns `None` when there is nothing to process: either the pull failed or the shard
    /// has no new data. Both cases already slept their backoff.
    async fn fetch(&mut self, cursor: &Cursor) -> Option<PullResult> {
        let permit = self.throttle.acquire().await;
        let started = Instant::now();
        let result = self
            .client
            .pull_logs(self.shard, cursor, self.config.query())
            .await;
        permit.release();
        self.monitor
            .record_fetch(result.as_ref().map(|r| &r.meta), started);

        let pulled = match result {
            Ok(pulled) => pulled,
            Err(e) => {
                warn!(shard_id=%self.shard, %cursor, error=%e, "failed to pull logs");
                tokio::time::sleep(FETCH_FAILED_DELAY).await;
                return None;
            }
        };

        self.tracker.set_current_cursor(cursor.clone());
        self.tracker.set_next_cursor(pulled.meta.next_cursor.clone());

        if pulled.meta.next_cursor == *cursor {
            debug!(shard_id=%self.shard, %cursor, "no new data in shard");
            self.flush_checkpoint_if_due().await;
            tokio::time::sleep(NO_PROGRESS_DELAY).await;
            return None;
        }

        debug!(
            shard_id=%self.shard,
            %cursor,
            next_cursor=%pulled.meta.next_cursor,
            count=pulled.meta.count,
            raw_size=pulled.meta.raw_size,
            "pulled logs"
        );
        Some(pulled)
    }

    /// Hand the batch to the processor until it is done with it, and return the cursor to
    /// fetch from next.
    async fn process(&mut self, log_groups: &LogGroupList, meta: &PullMeta) -> Cursor {
        loop {
            let started = Instant::now();
            let result = self.call_processor(log_groups).await;
            self.monitor.record_process(result.is_err(), started);

            self.flush_checkpoint_if_due().await;

            let rollback = match &result {
                Ok(rollback) => rollback.clone(),
                Err(e) => {
                    error!(shard_id=%self.shard, error=%e, "processor returned an error");
                    e.rollback().cloned()
                }
            };

            if let Some(rollback) = rollback.filter(|c| !c.is_empty()) {
                warn!(shard_id=%self.shard, cursor=%rollback, "processor rolled back the cursor");
                return rollback;
            }
            if result.is_ok() {
                return meta.next_cursor.clone();
            }
            if self.shutdown.is_cancelled() {
                warn!(
                    shard_id=%self.shard,
                    next_cursor=%meta.next_cursor,
                    "shutting down with a failed batch, skipping it"
                );
                return meta.next_cursor.clone();
            }

            tokio::time::sleep(PROCESS_FAILED_DELAY).await;
        }
    }

    /// Invoke the processor, converting a panic into an error.
    async fn call_processor(
        &mut self,
        log_groups: &LogGroupList,
    ) -> Result<Option<Cursor>, ProcessError> {
        let fut = self
            .processor
            .process(self.shard, log_groups, &mut self.tracker);

        match catch_async(fut).await {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    shard_id=%self.shard,
                    panic=%panic.message,
                    backtrace=%panic.backtrace,
                    "panic in processor"
                );
                Err(ProcessError::from_panic(&panic))
            }
        }
    }

    /// Persist the checkpoint when auto commit is on and the commit interval elapsed.
    ///
    /// A failure is logged and left for the next interval.
    async fn flush_checkpoint_if_due(&mut self) {
        if self.config.auto_commit_disabled {
            return;
        }
        if self.last_checkpoint_flush.elapsed() <= self.config.auto_commit_interval {
            return;
        }

        if let Err(e) = self.tracker.flush_checkpoint().await {
            warn!(shard_id=%self.shard, error=%e, "periodic checkpoint flush failed");
        }
        self.last_checkpoint_flush = Instant::now();
    }

    /// Run the processor's shutdown hook, then persist the checkpoint, then mark the worker
    /// stopped. Each step is retried until it succeeds.
    async fn shutdown_gracefully(&mut self) {
        info!(shard_id=%self.shard, "shard worker shutting down, invoking processor shutdown");

        loop {
            let fut = self.processor.shutdown(&mut self.tracker);
            let err = match catch_async(fut).await {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(panic) => ProcessError::from_panic(&panic),
            };
            error!(shard_id=%self.shard, error=%err, "processor shutdown failed");
            tokio::time::sleep(SHUTDOWN_FAILED_DELAY).await;
        }

        info!(shard_id=%self.shard, "processor shutdown done, flushing checkpoint");

        while let Err(e) = self.tracker.flush_checkpoint().await {
            error!(shard_id=%self.shard, error=%e, "failed to flush checkpoint while shutting down");
            tokio::time::sleep(FLUSH_CHECKPOINT_FAILED_DELAY).await;
        }

        info!(shard_id=%self.shard, "shard worker stopped");
        self.stopped.store(true, Ordering::Release);
    }
}
