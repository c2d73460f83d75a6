//! Running one worker per shard assigned to this consumer.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    client::{LogStoreClient, ShardLeaseClient},
    config::{self, ConsumerConfig},
    heartbeat::Heartbeat,
    model::ShardId,
    processor::ProcessorFactory,
    throttle::FetchThrottle,
    unwind,
    worker::ShardConsumerWorker,
};

/// How often shutdown checks whether all workers stopped.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Consumes every shard the consumer group assigns to this consumer.
///
/// Workers are created for newly assigned shards and asked to shut down for revoked ones. A
/// shard never has two workers: a worker is only replaced once it stopped, and the shard
/// stays claimed towards the consumer group until then.
///
/// All shard workers share one [`FetchThrottle`] of `max_io_workers` slots.
pub struct ShardOwner {
    inner: Arc<OwnerInner>,
    started: AtomicBool,
    main_task: Mutex<Option<JoinHandle<()>>>,
}

struct OwnerInner {
    config: Arc<ConsumerConfig>,
    client: Arc<dyn LogStoreClient>,
    factory: Arc<dyn ProcessorFactory>,
    heartbeat: Arc<Heartbeat>,
    throttle: FetchThrottle,
    workers: Mutex<BTreeMap<ShardId, ShardConsumerWorker>>,
    shutdown: CancellationToken,
}

impl ShardOwner {
    /// Validate `config` and set up an owner. Nothing runs before [`Self::start`].
    pub fn new(
        config: ConsumerConfig,
        client: Arc<dyn LogStoreClient>,
        lease_client: Arc<dyn ShardLeaseClient>,
        factory: impl ProcessorFactory,
    ) -> Result<Self, config::Error> {
        config.validate()?;

        let heartbeat = Arc::new(Heartbeat::new(lease_client, config.heartbeat_interval));
        let throttle = FetchThrottle::new(config.max_io_workers);

        Ok(Self {
            inner: Arc::new(OwnerInner {
                config: Arc::new(config),
                client,
                factory: Arc::new(factory),
                heartbeat,
                throttle,
                workers: Default::default(),
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            main_task: Mutex::new(None),
        })
    }

    /// Spawn the heartbeat and the owner loop on the current tokio runtime.
    ///
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let config = &self.inner.config;
        info!(
            project=%config.project,
            logstore=%config.logstore,
            consumer_group=%config.consumer_group_name,
            consumer=%config.consumer_name,
            "starting consumer"
        );

        let heartbeat_shutdown = CancellationToken::new();
        let heartbeat_task = tokio::spawn(
            Arc::clone(&self.inner.heartbeat).run(heartbeat_shutdown.clone()),
        );
        let main_task = tokio::spawn(
            Arc::clone(&self.inner).run(heartbeat_task, heartbeat_shutdown),
        );
        *self.main_task.lock() = Some(main_task);
    }

    /// Ask every worker to stop. Use [`Self::join`] to wait for them.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("consumer shutdown requested");
        }
        self.inner.shutdown.cancel();
    }

    /// Wait until every worker stopped and the heartbeat ended.
    ///
    /// Returns immediately if the owner was never started.
    pub async fn join(&self) {
        let Some(task) = self.main_task.lock().take() else {
            return;
        };
        if let Err(e) = task.await {
            error!(error=%e, "consumer task failed");
        }
    }

    pub async fn stop_and_wait(&self) {
        self.shutdown();
        self.join().await;
    }

    /// The shards that currently have a worker.
    pub fn shards(&self) -> Vec<ShardId> {
        self.inner.workers.lock().keys().copied().collect()
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.inner.heartbeat
    }
}

impl Debug for ShardOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardOwner")
            .field("inner", &self.inner)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Debug for OwnerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerInner")
            .field("config", &self.config)
            .field("heartbeat", &self.heartbeat)
            .field("throttle", &self.throttle)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl OwnerInner {
    async fn run(
        self: Arc<Self>,
        heartbeat_task: JoinHandle<()>,
        heartbeat_shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.data_fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.sync_workers();
        }

        self.stop_workers().await;

        heartbeat_shutdown.cancel();
        if let Err(e) = heartbeat_task.await {
            error!(error=%e, "heartbeat task failed");
        }
        info!("consumer stopped");
    }

    /// Bring the set of workers in line with the assignment.
    fn sync_workers(&self) {
        let assigned = self.heartbeat.assigned();
        let mut workers = self.workers.lock();

        workers.retain(|shard, worker| {
            if !assigned.contains(shard) && !worker.is_shutdown_requested() {
                info!(shard_id=%shard, "shard no longer assigned, stopping its worker");
                worker.shutdown();
            }
            if !worker.is_stopped() {
                return true;
            }
            info!(shard_id=%shard, "removing stopped shard worker");
            self.heartbeat.release(*shard);
            false
        });

        for shard in assigned {
            if workers.contains_key(&shard) {
                continue;
            }
            // a panicking factory leaves the shard without worker until the next tick
            let processor = match unwind::catch(|| self.factory.create(shard)) {
                Ok(processor) => processor,
                Err(panic) => {
                    error!(
                        shard_id=%shard,
                        panic=%panic.message,
                        backtrace=%panic.backtrace,
                        "panic in processor factory, retrying on next tick"
                    );
                    continue;
                }
            };
            info!(shard_id=%shard, "starting shard worker");
            let worker = ShardConsumerWorker::new(
                shard,
                Arc::clone(&self.config),
                Arc::clone(&self.client),
                processor,
                self.throttle.clone(),
            );
            worker.ensure_started();
            workers.insert(shard, worker);
        }

        for worker in workers.values() {
            if worker.should_report_metrics() {
                worker.report_metrics();
            }
        }
    }

    /// Shut down every worker and wait for all of them to stop.
    async fn stop_workers(&self) {
        for worker in self.workers.lock().values() {
            worker.shutdown();
        }

        loop {
            let remaining = {
                let mut workers = self.workers.lock();
                workers.retain(|shard, worker| {
                    if worker.is_stopped() {
                        self.heartbeat.release(*shard);
                        return false;
                    }
                    true
                });
                workers.len()
            };
            if remaining == 0 {
                break;
            }
            debug!(remaining, "waiting for shard workers to stop");
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::atomic::AtomicUsize};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        mock::MockLogStore,
        model::{Cursor, Log, LogContent, LogGroup},
        processor::FnProcessor,
    };

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            heartbeat_interval: Duration::from_millis(100),
            auto_commit_interval: Duration::from_secs(1),
            ..ConsumerConfig::new_testing()
        }
    }

    fn fill(store: &MockLogStore, shard: ShardId, n: usize) {
        store.append(
            shard,
            (0..n).map(|i| LogGroup {
                logs: vec![Log {
                    time: i as u32,
                    contents: vec![LogContent::new("i", i.to_string())],
                }],
                ..Default::default()
            }),
        );
    }

    fn counting_processor() -> (FnProcessor, Arc<AtomicUsize>) {
        let consumed = Arc::new(AtomicUsize::new(0));
        let processor = FnProcessor::new({
            let consumed = Arc::clone(&consumed);
            move |_, groups, _| {
                consumed.fetch_add(groups.len(), Ordering::SeqCst);
                Ok(None)
            }
        });
        (processor, consumed)
    }

    async fn wait_for(mut cond: impl FnMut() -> bool + Send) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(MockLogStore::new());
        let (processor, _) = counting_processor();
        let config = ConsumerConfig {
            max_io_workers: 0,
            ..config()
        };
        let err = ShardOwner::new(config, Arc::clone(&store) as _, store, processor).unwrap_err();
        assert_eq!(
            err,
            config::Error::Zero {
                field: "max_io_workers"
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_shard_is_released_after_its_worker_stopped() {
        let store = MockLogStore::new();
        let (s0, s1) = (ShardId::new(0), ShardId::new(1));
        fill(&store, s0, 30);
        fill(&store, s1, 30);
        store.assign([s0, s1]);

        let (processor, consumed) = counting_processor();
        let owner = ShardOwner::new(
            config(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            processor,
        )
        .unwrap();
        owner.start();
        owner.start();

        wait_for(|| consumed.load(Ordering::SeqCst) == 60).await;
        assert_eq!(owner.shards(), vec![s0, s1]);

        store.assign([s1]);
        wait_for(|| owner.shards() == vec![s1]).await;
        // the worker persisted its progress before the shard was given up
        assert_eq!(store.checkpoint(s0), Some(Cursor::from("30")));
        wait_for(|| {
            store
                .heartbeats()
                .last()
                .is_some_and(|held| held == &vec![s1])
        })
        .await;
        assert_eq!(owner.heartbeat().held(), BTreeSet::from([s1]));

        // handing the shard back starts a fresh worker from the checkpoint
        fill(&store, s0, 5);
        store.assign([s0, s1]);
        wait_for(|| consumed.load(Ordering::SeqCst) == 65).await;
        assert_eq!(owner.shards(), vec![s0, s1]);

        owner.stop_and_wait().await;
        assert!(owner.shards().is_empty());
        assert_eq!(store.checkpoint(s0), Some(Cursor::from("35")));
        assert_eq!(store.checkpoint(s1), Some(Cursor::from("30")));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_factory_is_retried() {
        let store = MockLogStore::new();
        let shard = ShardId::new(3);
        fill(&store, shard, 10);
        store.assign([shard]);

        let (processor, consumed) = counting_processor();
        let created = Arc::new(AtomicUsize::new(0));
        let factory = {
            let created = Arc::clone(&created);
            move |shard: ShardId| {
                if created.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("processor dependencies not ready");
                }
                processor.create(shard)
            }
        };
        let owner = ShardOwner::new(
            config(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            factory,
        )
        .unwrap();
        owner.start();

        wait_for(|| consumed.load(Ordering::SeqCst) == 10).await;
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(owner.shards(), vec![shard]);

        owner.stop_and_wait().await;
        assert_eq!(store.checkpoint(shard), Some(Cursor::from("10")));
    }

    #[tokio::test(start_paused = true)]
    async fn join_without_start_returns() {
        let store = Arc::new(MockLogStore::new());
        let (processor, _) = counting_processor();
        let owner = ShardOwner::new(config(), Arc::clone(&store) as _, store, processor).unwrap();
        owner.stop_and_wait().await;
        assert!(owner.shards().is_empty());
    }
}
