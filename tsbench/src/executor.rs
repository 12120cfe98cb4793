//! The concurrent executor.
//!
//! A run has three stages connected by bounded channels:
//!
//! ```text
//! decode (blocking thread) --items--> W workers (tokio tasks) --stats--> aggregator
//! ```
//!
//! The decode stage reads work items one by one into pooled objects and places them on the
//! worker queues, blocking while the queues are full. Backpressure is the only flow control.
//! Each worker owns a [`Handler`] that talks to the target, times every call, and emits
//! [`Stat`]s for the aggregator.
//!
//! With [`Distribution::Sharded`], every item goes to worker `series_hash % W`. Each worker
//! handles its items in order, so items of one series are processed in input order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::error::{Error, Result};
use crate::pool::{Pool, Recycle};
use crate::stats::Stat;

/// An item of work that flows through the executor.
pub trait WorkItem: Recycle + Default + Send + Sync + 'static {
    /// Label that latency statistics of this item are grouped under.
    fn label(&self) -> &str;

    /// Hash that decides the worker of this item under sharded distribution.
    fn series_hash(&self) -> u64;
}

/// Reads work items from an input stream.
pub trait Decoder: Send + 'static {
    /// The item type produced.
    type Item: WorkItem;

    /// Fills `item` with the next item of the input.
    ///
    /// Returns `Ok(false)` at the end of input, leaving `item` untouched.
    fn decode_next(&mut self, item: &mut Self::Item) -> Result<bool>;
}

/// Per-worker processing of work items.
#[async_trait::async_trait]
pub trait Handler: Send + 'static {
    /// The item type consumed.
    type Item: WorkItem;

    /// Processes one item, recording the duration of its sub-phases into `phases`.
    async fn handle(&mut self, item: &Self::Item, phases: &mut Phases) -> Result<()>;

    /// Called once the queue of this worker is drained.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sub-phase timings of a single item.
#[derive(Debug, Default)]
pub struct Phases {
    timings: Vec<(&'static str, Duration)>,
}

impl Phases {
    /// Records that `phase` took `elapsed`.
    pub fn record(&mut self, phase: &'static str, elapsed: Duration) {
        self.timings.push((phase, elapsed));
    }

    /// Iterates over recorded phases in order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Duration)> + '_ {
        self.timings.iter().copied()
    }

    /// Removes all recorded phases.
    pub fn clear(&mut self) {
        self.timings.clear();
    }
}

/// How items are assigned to workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// One queue of capacity `W`, drained by whichever worker is free.
    Shared,
    /// One queue per worker; items go to worker `series_hash % W`.
    Sharded {
        /// Capacity of each worker queue.
        capacity: usize,
    },
}

impl Distribution {
    /// Sharded distribution with single-item queues.
    pub fn sharded() -> Self {
        Self::Sharded { capacity: 1 }
    }
}

/// Returns the worker a hash is assigned to under sharded distribution.
pub fn shard_for(series_hash: u64, workers: usize) -> usize {
    (series_hash % workers as u64) as usize
}

/// Lifecycle of an [`Executor`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecutorState {
    /// Not started yet.
    Idle = 0,
    /// Decoding and processing items.
    Running = 1,
    /// Input is exhausted; workers finish their queues.
    Draining = 2,
    /// Every stage has exited.
    Stopped = 3,
}

impl ExecutorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Clone, Debug)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn get(&self) -> ExecutorState {
        ExecutorState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: ExecutorState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Parameters of an [`Executor`].
#[derive(Clone, Copy, Debug)]
pub struct ExecutorConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Stop decoding after this many items.
    pub limit: Option<u64>,
    /// Item placement strategy.
    pub distribution: Distribution,
}

/// Counters of a finished run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutorReport {
    /// Items handed to workers by the decode stage.
    pub dispatched: u64,
    /// Items processed by workers.
    pub processed: u64,
}

/// Runs a decoded workload against per-worker handlers.
pub struct Executor<T> {
    config: ExecutorConfig,
    items: Arc<Pool<T>>,
    stats: Arc<Pool<Stat>>,
    state: StateCell,
}

impl<T: WorkItem> Executor<T> {
    /// Creates an executor drawing items and stats from the given pools.
    pub fn new(config: ExecutorConfig, items: Arc<Pool<T>>, stats: Arc<Pool<Stat>>) -> Self {
        Self {
            config,
            items,
            stats,
            state: StateCell(Arc::new(AtomicU8::new(ExecutorState::Idle as u8))),
        }
    }

    /// The configuration this executor runs with.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// The pool stats are drawn from; the aggregator returns consumed stats here.
    pub fn stat_pool(&self) -> &Arc<Pool<Stat>> {
        &self.stats
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.state.get()
    }

    /// Decodes `decoder` to exhaustion (or the item limit) and processes every item.
    ///
    /// `make_handler` is called once per worker index before anything starts. Stats are sent to
    /// `stats`; the sender is dropped when all workers have exited. The first error of any stage
    /// aborts the run and is returned.
    pub async fn run<D, H, F>(
        &self,
        decoder: D,
        mut make_handler: F,
        stats: mpsc::Sender<Stat>,
    ) -> Result<ExecutorReport>
    where
        D: Decoder<Item = T>,
        H: Handler<Item = T>,
        F: FnMut(usize) -> Result<H>,
    {
        let workers = self.config.workers;
        if workers == 0 {
            return Err(Error::Config("at least one worker is required".to_owned()));
        }
        let handlers = (0..workers)
            .map(&mut make_handler)
            .collect::<Result<Vec<_>>>()?;

        self.state.set(ExecutorState::Running);
        let (queues, receivers) = Queues::new(self.config.distribution, workers);
        tracing::debug!(workers, distribution = ?self.config.distribution, "starting executor");

        let mut tasks = JoinSet::new();
        for (index, (handler, receiver)) in handlers.into_iter().zip(receivers).enumerate() {
            let worker = Worker {
                index,
                handler,
                items: receiver,
                item_pool: Arc::clone(&self.items),
                stat_pool: Arc::clone(&self.stats),
                stats: stats.clone(),
            };
            tasks.spawn(worker.run());
        }
        drop(stats);

        let decode = {
            let queues = queues.clone();
            let pool = Arc::clone(&self.items);
            let limit = self.config.limit;
            let state = self.state.clone();
            tokio::task::spawn_blocking(move || {
                let result = decode(decoder, &queues, &pool, limit);
                queues.close();
                state.set(ExecutorState::Draining);
                result
            })
        };

        let mut first_error = None;
        let mut processed = 0;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| Error::WorkerPanicked(e.to_string()));
            match outcome.and_then(|r| r) {
                Ok(count) => processed += count,
                Err(error) => {
                    if first_error.is_none() {
                        tracing::debug!(%error, "worker failed, closing queues");
                        queues.close();
                        first_error = Some(error);
                    }
                }
            }
        }

        let decoded = decode
            .await
            .map_err(|e| Error::WorkerPanicked(e.to_string()))
            .and_then(|r| r);
        self.state.set(ExecutorState::Stopped);

        match (first_error, decoded) {
            (Some(error), _) => Err(error),
            (None, Err(error)) => Err(error),
            (None, Ok(dispatched)) => {
                tracing::debug!(dispatched, processed, "executor stopped");
                Ok(ExecutorReport {
                    dispatched,
                    processed,
                })
            }
        }
    }
}

impl<T> fmt::Debug for Executor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

fn decode<D: Decoder>(
    mut decoder: D,
    queues: &Queues<D::Item>,
    pool: &Pool<D::Item>,
    limit: Option<u64>,
) -> Result<u64> {
    let mut dispatched = 0;
    while limit.is_none_or(|limit| dispatched < limit) {
        let mut item = pool.get();
        match decoder.decode_next(&mut item) {
            Ok(true) => {}
            Ok(false) => {
                pool.put(item);
                break;
            }
            Err(error) => {
                pool.put(item);
                return Err(error);
            }
        }
        queues.dispatch(item)?;
        dispatched += 1;
    }
    Ok(dispatched)
}

struct Queues<T> {
    senders: Vec<Sender<T>>,
    sharded: bool,
}

impl<T> Clone for Queues<T> {
    fn clone(&self) -> Self {
        Self {
            senders: self.senders.clone(),
            sharded: self.sharded,
        }
    }
}

impl<T: WorkItem> Queues<T> {
    fn new(distribution: Distribution, workers: usize) -> (Self, Vec<Receiver<T>>) {
        match distribution {
            Distribution::Shared => {
                let (sender, receiver) = async_channel::bounded(workers);
                let receivers = vec![receiver; workers];
                let queues = Self {
                    senders: vec![sender],
                    sharded: false,
                };
                (queues, receivers)
            }
            Distribution::Sharded { capacity } => {
                let (senders, receivers) = (0..workers)
                    .map(|_| async_channel::bounded(capacity.max(1)))
                    .unzip();
                let queues = Self {
                    senders,
                    sharded: true,
                };
                (queues, receivers)
            }
        }
    }

    fn dispatch(&self, item: T) -> Result<()> {
        let index = if self.sharded {
            shard_for(item.series_hash(), self.senders.len())
        } else {
            0
        };
        self.senders[index]
            .send_blocking(item)
            .map_err(|_| Error::QueueClosed)
    }

    fn close(&self) {
        for sender in &self.senders {
            sender.close();
        }
    }
}

struct Worker<H: Handler> {
    index: usize,
    handler: H,
    items: Receiver<H::Item>,
    item_pool: Arc<Pool<H::Item>>,
    stat_pool: Arc<Pool<Stat>>,
    stats: mpsc::Sender<Stat>,
}

impl<H: Handler> Worker<H> {
    async fn run(mut self) -> Result<u64> {
        let mut phases = Phases::default();
        let mut processed = 0;

        while let Ok(item) = self.items.recv().await {
            phases.clear();
            let start = Instant::now();
            let result = self.handler.handle(&item, &mut phases).await;
            let elapsed = start.elapsed();

            if let Err(error) = result {
                self.item_pool.put(item);
                return Err(error);
            }

            // Sub-phases go first, so that a burned-in total takes its phases with it.
            for (phase, duration) in phases.iter() {
                let mut stat = self.stat_pool.get();
                stat.label.push_str(item.label());
                stat.label.push('-');
                stat.label.push_str(phase);
                stat.value = millis(duration);
                emit(&self.stats, stat).await?;
            }
            let mut stat = self.stat_pool.get();
            stat.set(item.label(), millis(elapsed), true);
            emit(&self.stats, stat).await?;

            self.item_pool.put(item);
            processed += 1;
        }

        self.handler.finish().await?;
        tracing::debug!(worker = self.index, processed, "worker finished");
        Ok(processed)
    }
}

async fn emit(stats: &mpsc::Sender<Stat>, stat: Stat) -> Result<()> {
    stats.send(stat).await.map_err(|_| Error::QueueClosed)
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1e3
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Item {
        label: String,
        key: u64,
    }

    impl Recycle for Item {
        fn recycle(&mut self) {
            self.label.clear();
            self.key = 0;
        }
    }

    impl WorkItem for Item {
        fn label(&self) -> &str {
            &self.label
        }

        fn series_hash(&self) -> u64 {
            let mut hasher = DefaultHasher::new();
            self.key.hash(&mut hasher);
            hasher.finish()
        }
    }

    struct Counter {
        next: u64,
        end: u64,
        fail_at: Option<u64>,
    }

    impl Decoder for Counter {
        type Item = Item;

        fn decode_next(&mut self, item: &mut Item) -> Result<bool> {
            if self.fail_at == Some(self.next) {
                return Err(Error::Malformed {
                    line: self.next + 1,
                    reason: "broken".to_owned(),
                });
            }
            if self.next == self.end {
                return Ok(false);
            }
            item.label.push_str("op");
            item.key = self.next;
            self.next += 1;
            Ok(true)
        }
    }

    fn counter(end: u64) -> Counter {
        Counter {
            next: 0,
            end,
            fail_at: None,
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<(usize, u64)>>>,
        finished: Arc<Mutex<Vec<usize>>>,
    }

    struct Recording {
        index: usize,
        recorder: Recorder,
        fail_on: Option<u64>,
    }

    #[async_trait::async_trait]
    impl Handler for Recording {
        type Item = Item;

        async fn handle(&mut self, item: &Item, phases: &mut Phases) -> Result<()> {
            if self.fail_on == Some(item.key) {
                return Err(Error::Config("handler failed".to_owned()));
            }
            phases.record("inner", Duration::from_micros(10));
            self.recorder.seen.lock().unwrap().push((self.index, item.key));
            Ok(())
        }

        async fn finish(&mut self) -> Result<()> {
            self.recorder.finished.lock().unwrap().push(self.index);
            Ok(())
        }
    }

    fn executor(workers: usize, limit: Option<u64>, distribution: Distribution) -> Executor<Item> {
        let config = ExecutorConfig {
            workers,
            limit,
            distribution,
        };
        Executor::new(config, Pool::shared(), Pool::shared())
    }

    async fn drain(mut rx: mpsc::Receiver<Stat>) -> Vec<Stat> {
        let mut stats = Vec::new();
        while let Some(stat) = rx.recv().await {
            stats.push(stat);
        }
        stats
    }

    #[tokio::test]
    async fn processes_everything_shared() {
        let executor = executor(4, None, Distribution::Shared);
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(4);
        let collected = tokio::spawn(drain(rx));

        assert_eq!(executor.state(), ExecutorState::Idle);
        let report = executor
            .run(counter(50), |index| {
                Ok(Recording {
                    index,
                    recorder: recorder.clone(),
                    fail_on: None,
                })
            }, tx)
            .await
            .unwrap();
        assert_eq!(executor.state(), ExecutorState::Stopped);

        assert_eq!(report, ExecutorReport { dispatched: 50, processed: 50 });
        let mut keys: Vec<_> = recorder.seen.lock().unwrap().iter().map(|(_, k)| *k).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..50).collect::<Vec<_>>());

        let mut finished = recorder.finished.lock().unwrap().clone();
        finished.sort_unstable();
        assert_eq!(finished, vec![0, 1, 2, 3]);

        let stats = collected.await.unwrap();
        assert_eq!(stats.len(), 100);
        let totals = stats.iter().filter(|s| s.is_actual);
        assert!(totals.clone().all(|s| s.label == "op"));
        assert_eq!(totals.count(), 50);
        let phases = stats.iter().filter(|s| !s.is_actual);
        assert!(phases.clone().all(|s| s.label == "op-inner"));
        assert_eq!(phases.count(), 50);
    }

    #[tokio::test]
    async fn sharded_items_keep_their_worker_and_order() {
        let executor = executor(3, None, Distribution::sharded());
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(3);
        tokio::spawn(drain(rx));

        executor
            .run(counter(60), |index| {
                Ok(Recording {
                    index,
                    recorder: recorder.clone(),
                    fail_on: None,
                })
            }, tx)
            .await
            .unwrap();

        let seen = recorder.seen.lock().unwrap();
        for worker in 0..3 {
            let actual: Vec<_> = seen.iter().filter(|(w, _)| *w == worker).map(|(_, k)| *k).collect();
            let expected: Vec<_> = (0..60)
                .filter(|key| {
                    let item = Item { label: String::new(), key: *key };
                    shard_for(item.series_hash(), 3) == worker
                })
                .collect();
            assert_eq!(actual, expected);
        }
    }

    #[tokio::test]
    async fn limit_stops_decoding() {
        let executor = executor(2, Some(7), Distribution::Shared);
        let recorder = Recorder::default();
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(drain(rx));

        let report = executor
            .run(counter(100), |index| {
                Ok(Recording {
                    index,
                    recorder: recorder.clone(),
                    fail_on: None,
                })
            }, tx)
            .await
            .unwrap();

        assert_eq!(report.dispatched, 7);
        assert_eq!(recorder.seen.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn decode_errors_are_returned() {
        let executor = executor(2, None, Distribution::Shared);
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(drain(rx));
        let decoder = Counter {
            next: 0,
            end: 100,
            fail_at: Some(3),
        };

        let err = executor
            .run(decoder, |index| {
                Ok(Recording {
                    index,
                    recorder: Recorder::default(),
                    fail_on: None,
                })
            }, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Malformed { line: 4, .. }));
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[tokio::test]
    async fn handler_errors_abort_the_run() {
        let executor = executor(2, None, Distribution::sharded());
        let (tx, rx) = mpsc::channel(2);
        tokio::spawn(drain(rx));

        let err = executor
            .run(counter(10_000), |index| {
                Ok(Recording {
                    index,
                    recorder: Recorder::default(),
                    fail_on: Some(5),
                })
            }, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(reason) if reason == "handler failed"));
    }

    #[tokio::test]
    async fn zero_workers_is_a_config_error() {
        let executor = executor(0, None, Distribution::Shared);
        let (tx, _rx) = mpsc::channel(1);
        let result = executor
            .run(counter(1), |index| {
                Ok(Recording {
                    index,
                    recorder: Recorder::default(),
                    fail_on: None,
                })
            }, tx)
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(executor.state(), ExecutorState::Idle);
    }
}
