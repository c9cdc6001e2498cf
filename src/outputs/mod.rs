//! Output fan-out: per-sink worker pools behind a bounded event channel.
//!
//! Producers run the output's processor chain and block on the channel
//! when it is full. Workers batch events toward the sink; when the sink's
//! health lapses the output broadcasts `reset` (workers abandon in-flight
//! batches and park), and `start` when health returns. The broadcast is
//! the close-and-recreate channel idiom, built on a replaceable tripwire.

pub mod file;
pub mod influxdb;
pub mod prometheus;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use metrics::Counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tripwire::{Trigger, Tripwire};

use crate::cache::{CacheConfig, OnChangeCache};
use crate::config::OutputOuter;
use crate::event::EventMsg;
use crate::pipeline::{make_processors, Pipeline, ProcessorConfig, ProcessorContext};
use crate::shutdown::ShutdownSignal;

/// A concrete downstream sink. Batches arrive already processed.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    async fn write_batch(&self, batch: Vec<EventMsg>) -> crate::Result<()>;

    /// Liveness probe; the default never fails, so outputs without one
    /// never reset.
    async fn healthy(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Registry of output kinds, keyed by the `type` field of each entry
/// under `outputs`.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait OutputConfig: Debug + Send + Sync {
    async fn build(&self, name: &str, shutdown: ShutdownSignal) -> crate::Result<Arc<dyn Sink>>;

    /// On-change cache settings, for kinds that support one.
    fn cache(&self) -> Option<&CacheConfig> {
        None
    }
}

/// One-shot broadcast that can be re-armed: firing wakes every current
/// listener, after which new listeners wait for the next firing.
pub struct Sentinel {
    inner: Mutex<SentinelInner>,
}

struct SentinelInner {
    trigger: Option<Trigger>,
    tripwire: Tripwire,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentinel {
    pub fn new() -> Self {
        let (trigger, tripwire) = Tripwire::new();
        Self {
            inner: Mutex::new(SentinelInner {
                trigger: Some(trigger),
                tripwire,
            }),
        }
    }

    /// Wake every listener and re-arm.
    pub fn notify(&self) {
        let mut inner = self.inner.lock();
        if let Some(trigger) = inner.trigger.take() {
            trigger.cancel();
        }

        let (trigger, tripwire) = Tripwire::new();
        inner.trigger = Some(trigger);
        inner.tripwire = tripwire;
    }

    /// A future resolving at the next [`Sentinel::notify`].
    pub fn listen(&self) -> Tripwire {
        self.inner.lock().tripwire.clone()
    }
}

/// Worker pool knobs shared by every output kind.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub buffer_size: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_timer: Duration,
    /// Zero disables the health loop.
    pub health_check_period: Duration,
    pub cache: Option<CacheConfig>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            workers: 1,
            batch_size: 1000,
            flush_timer: Duration::from_secs(10),
            health_check_period: Duration::ZERO,
            cache: None,
        }
    }
}

impl From<&OutputOuter> for WorkerOptions {
    fn from(outer: &OutputOuter) -> Self {
        Self {
            buffer_size: outer.buffer_size.max(1),
            workers: outer.workers.max(1),
            batch_size: outer.batch_size.max(1),
            flush_timer: outer.flush_timer,
            health_check_period: outer.health_check_period,
            cache: outer.inner.cache().cloned(),
        }
    }
}

/// The handle producers write into.
pub struct Output {
    name: String,
    tx: mpsc::Sender<EventMsg>,
    pipeline: tokio::sync::Mutex<Pipeline>,
    cache: Option<Arc<OnChangeCache>>,

    received: Counter,
}

impl Output {
    /// Run the processor chain and push each surviving event. Blocks when
    /// the channel is full; that is the backpressure. Per-producer order
    /// is preserved because each producer awaits its own sends in order.
    pub async fn write_events(&self, events: Vec<EventMsg>) {
        if events.is_empty() {
            return;
        }

        self.received.inc(events.len() as u64);

        let events = {
            let mut pipeline = self.pipeline.lock().await;
            pipeline.apply(events).await
        };

        if let Some(cache) = &self.cache {
            cache.insert(events);
            return;
        }

        for event in events {
            if self.tx.send(event).await.is_err() {
                return;
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone)]
struct WorkerContext {
    name: String,
    index: usize,
    sink: Arc<dyn Sink>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EventMsg>>>,
    reset: Arc<Sentinel>,
    start: Arc<Sentinel>,
    batch_size: usize,
    flush_timer: Duration,
    shutdown: ShutdownSignal,

    written: Counter,
    errors: Counter,
}

async fn flush_batch(worker: &WorkerContext, batch: &mut Vec<EventMsg>) {
    if batch.is_empty() {
        return;
    }

    let count = batch.len() as u64;
    match worker.sink.write_batch(std::mem::take(batch)).await {
        Ok(()) => worker.written.inc(count),
        Err(err) => {
            worker.errors.inc(1);
            warn!(
                message = "write batch failed",
                output = %worker.name,
                worker = worker.index,
                %err,
            );
        }
    }
}

/// `Starting -> Running -> Resetting -> Running -> ... -> Stopped`.
async fn run_worker(worker: WorkerContext) {
    let mut shutdown = worker.shutdown.clone();
    let rx = Arc::clone(&worker.rx);
    let mut first_start = true;

    'starting: loop {
        if !first_start {
            debug!(
                message = "worker waiting for sink recovery",
                output = %worker.name,
                worker = worker.index,
            );

            let start = worker.start.listen();
            tokio::select! {
                _ = &mut shutdown => return,
                _ = start => {}
            }
        }
        first_start = false;

        debug!(message = "starting worker", output = %worker.name, worker = worker.index);

        let reset = worker.reset.listen();
        tokio::pin!(reset);

        let mut batch: Vec<EventMsg> = Vec::with_capacity(worker.batch_size);
        let mut flush = tokio::time::interval(worker.flush_timer);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush.reset();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    flush_batch(&worker, &mut batch).await;
                    debug!(
                        message = "worker terminating",
                        output = %worker.name,
                        worker = worker.index,
                    );
                    return;
                }
                _ = &mut reset => {
                    // in-flight batch is abandoned, the channel backlog
                    // stays put for the restart
                    debug!(
                        message = "resetting worker",
                        output = %worker.name,
                        worker = worker.index,
                    );
                    continue 'starting;
                }
                received = async { rx.lock().await.recv().await } => {
                    match received {
                        Some(event) => {
                            if event.is_empty() {
                                continue;
                            }

                            batch.push(event);
                            if batch.len() >= worker.batch_size {
                                flush_batch(&worker, &mut batch).await;
                            }
                        }
                        None => {
                            flush_batch(&worker, &mut batch).await;
                            return;
                        }
                    }
                }
                _ = flush.tick() => flush_batch(&worker, &mut batch).await,
            }
        }
    }
}

/// Probes the sink on a period; a health transition broadcasts `reset`
/// (down) or `start` (up).
async fn health_loop(
    name: String,
    sink: Arc<dyn Sink>,
    period: Duration,
    reset: Arc<Sentinel>,
    start: Arc<Sentinel>,
    mut shutdown: ShutdownSignal,
) {
    let mut was_up = true;
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = ticker.tick() => {}
        }

        match sink.healthy().await {
            Ok(()) => {
                if !was_up {
                    info!(message = "sink recovered", output = %name);
                    was_up = true;
                    start.notify();
                }
            }
            Err(err) => {
                warn!(message = "sink health check failed", output = %name, %err);
                if was_up {
                    was_up = false;
                    reset.notify();
                }
            }
        }
    }
}

/// Build one output from config: sink, processor chain, channel, workers,
/// health loop and optional on-change cache flusher.
pub async fn start_output(
    name: &str,
    outer: &OutputOuter,
    processors: &IndexMap<String, Box<dyn ProcessorConfig>>,
    cx: &ProcessorContext,
    shutdown: ShutdownSignal,
) -> crate::Result<Arc<Output>> {
    let sink = outer.inner.build(name, shutdown.clone()).await?;
    let pipeline = make_processors(&outer.event_processors, processors, cx)?;

    start_output_with_sink(name, sink, WorkerOptions::from(outer), pipeline, shutdown)
}

/// Wire the worker pool around an already-built sink.
pub fn start_output_with_sink(
    name: &str,
    sink: Arc<dyn Sink>,
    options: WorkerOptions,
    pipeline: Pipeline,
    shutdown: ShutdownSignal,
) -> crate::Result<Arc<Output>> {
    let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let reset = Arc::new(Sentinel::new());
    let start = Arc::new(Sentinel::new());

    let received = metrics::register_counter(
        "output_events_received_total",
        "Events handed to this output by producers.",
    )
    .recorder([("output", name.to_string())]);
    let written = metrics::register_counter(
        "output_events_written_total",
        "Events written to the downstream sink.",
    )
    .recorder([("output", name.to_string())]);
    let errors = metrics::register_counter(
        "output_write_errors_total",
        "Batch writes the sink rejected.",
    )
    .recorder([("output", name.to_string())]);

    for index in 0..options.workers.max(1) {
        let worker = WorkerContext {
            name: name.to_string(),
            index,
            sink: Arc::clone(&sink),
            rx: Arc::clone(&rx),
            reset: Arc::clone(&reset),
            start: Arc::clone(&start),
            batch_size: options.batch_size.max(1),
            flush_timer: options.flush_timer,
            shutdown: shutdown.clone(),
            written: written.clone(),
            errors: errors.clone(),
        };

        // a panicking worker is logged and replaced, the pool never shrinks
        tokio::spawn(async move {
            loop {
                let task = tokio::spawn(run_worker(worker.clone()));
                match task.await {
                    Err(err) if err.is_panic() => {
                        error!(
                            message = "output worker panicked, restarting it",
                            output = %worker.name,
                            worker = worker.index,
                        );
                    }
                    _ => return,
                }
            }
        });
    }

    if !options.health_check_period.is_zero() {
        tokio::spawn(health_loop(
            name.to_string(),
            Arc::clone(&sink),
            options.health_check_period,
            Arc::clone(&reset),
            Arc::clone(&start),
            shutdown.clone(),
        ));
    }

    let cache = if let Some(cache_config) = &options.cache {
        let cache = Arc::new(OnChangeCache::new());
        tokio::spawn(flush_cache_loop(
            Arc::clone(&cache),
            cache_config.flush_timer,
            tx.clone(),
            shutdown,
        ));
        Some(cache)
    } else {
        None
    };

    Ok(Arc::new(Output {
        name: name.to_string(),
        tx,
        pipeline: tokio::sync::Mutex::new(pipeline),
        cache,
        received,
    }))
}

async fn flush_cache_loop(
    cache: Arc<OnChangeCache>,
    flush_timer: Duration,
    tx: mpsc::Sender<EventMsg>,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(flush_timer);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => return,
            _ = ticker.tick() => {}
        }

        for event in cache.drain_changed() {
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl Output {
    /// A bare output with no workers behind it; the receiver exposes
    /// exactly what producers pushed.
    pub fn new_test(name: &str) -> (Arc<Output>, mpsc::Receiver<EventMsg>) {
        let (tx, rx) = mpsc::channel(64 * 1024);

        (
            Arc::new(Output {
                name: name.to_string(),
                tx,
                pipeline: tokio::sync::Mutex::new(Pipeline::empty()),
                cache: None,
                received: metrics::register_counter(
                    "output_events_received_total",
                    "Events handed to this output by producers.",
                )
                .recorder([("output", name.to_string())]),
            }),
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn sentinel_wakes_all_current_listeners() {
        let sentinel = Sentinel::new();

        let mut a = sentinel.listen();
        let mut b = sentinel.listen();
        assert!((&mut a).now_or_never().is_none());

        sentinel.notify();
        assert!((&mut a).now_or_never().is_some());
        assert!((&mut b).now_or_never().is_some());

        // re-armed for the next round
        let mut c = sentinel.listen();
        assert!((&mut c).now_or_never().is_none());
        sentinel.notify();
        assert!((&mut c).now_or_never().is_some());
    }

    #[tokio::test]
    async fn worker_batches_by_size() {
        use crate::testing::RecordingSink;

        let sink = Arc::new(RecordingSink::new());
        let output = start_output_with_sink(
            "out",
            Arc::clone(&sink) as Arc<dyn Sink>,
            WorkerOptions {
                batch_size: 3,
                flush_timer: Duration::from_secs(3600),
                ..Default::default()
            },
            Pipeline::empty(),
            ShutdownSignal::noop(),
        )
        .unwrap();

        let mut events = Vec::new();
        for i in 0..6 {
            let mut event = EventMsg::new("s", i);
            event
                .values
                .insert("v".into(), crate::event::Value::Int(i));
            events.push(event);
        }
        output.write_events(events).await;

        sink.wait_for_batches(2).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1].len(), 3);
    }

    #[tokio::test]
    async fn worker_flushes_on_timer() {
        use crate::testing::RecordingSink;

        let sink = Arc::new(RecordingSink::new());
        let output = start_output_with_sink(
            "out",
            Arc::clone(&sink) as Arc<dyn Sink>,
            WorkerOptions {
                batch_size: 1000,
                flush_timer: Duration::from_millis(30),
                ..Default::default()
            },
            Pipeline::empty(),
            ShutdownSignal::noop(),
        )
        .unwrap();

        let mut event = EventMsg::new("s", 1);
        event.values.insert("v".into(), crate::event::Value::Int(1));
        output.write_events(vec![event]).await;

        sink.wait_for_batches(1).await;
        assert_eq!(sink.batches()[0].len(), 1);
    }

    #[tokio::test]
    async fn unhealthy_sink_resets_workers_and_keeps_backlog() {
        use crate::testing::RecordingSink;

        let sink = Arc::new(RecordingSink::new());
        let output = start_output_with_sink(
            "out",
            Arc::clone(&sink) as Arc<dyn Sink>,
            WorkerOptions {
                batch_size: 1,
                flush_timer: Duration::from_millis(20),
                health_check_period: Duration::from_millis(20),
                buffer_size: 100,
                ..Default::default()
            },
            Pipeline::empty(),
            ShutdownSignal::noop(),
        )
        .unwrap();

        // prove the path works while healthy
        let mut event = EventMsg::new("s", 1);
        event.values.insert("v".into(), crate::event::Value::Int(1));
        output.write_events(vec![event.clone()]).await;
        sink.wait_for_batches(1).await;

        // sink goes down; workers park after the next health period
        sink.set_healthy(false);
        sink.wait_for_health_failures(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let before = sink.batches().len();
        for ts in 10..15 {
            let mut event = EventMsg::new("s", ts);
            event.values.insert("v".into(), crate::event::Value::Int(ts));
            output.write_events(vec![event]).await;
        }

        // parked workers do not consume
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batches().len(), before);

        // recovery: the whole backlog drains, nothing lost
        sink.set_healthy(true);
        sink.wait_for_events(6).await;

        let delivered: Vec<i64> = sink
            .batches()
            .into_iter()
            .flatten()
            .map(|event| event.timestamp)
            .collect();
        assert_eq!(delivered, vec![1, 10, 11, 12, 13, 14]);
    }
}
