//! Per-target subscription lifecycle: lock, connect, stream, convert,
//! fan out; reconnect with jittered backoff on RPC errors; shed the
//! target entirely on lock expiry and wait to be re-dispatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, select_all, BoxStream, StreamExt};
use indexmap::IndexMap;
use tokio_stream::wrappers::BroadcastStream;
use metrics::Counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tripwire::{Trigger, Tripwire};

use crate::config::{SubscriptionConfig, TargetConfig};
use crate::coordination::SharedLocker;
use crate::event::events_from_notification;
use crate::gnmi::{Connector, SubscribeRequest, SubscribeResponse};
use crate::outputs::Output;
use crate::shutdown::ShutdownSignal;

const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// What the admin API reports for one running target.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetState {
    AcquiringLock,
    Connecting,
    Running,
    Backoff,
}

struct ActiveTarget {
    config: Arc<TargetConfig>,
    stop: Option<Trigger>,
    state: Arc<Mutex<TargetState>>,
    /// Supervisor task, for teardown that wants to wait.
    handle: Option<tokio::task::JoinHandle<()>>,
    /// Distinguishes this task from a restarted successor under the same
    /// name.
    epoch: u64,
}

/// Owns every per-target task on this instance.
pub struct TargetManager {
    instance_name: String,
    cluster_name: Option<String>,
    locker: Option<SharedLocker>,
    connector: Arc<dyn Connector>,
    outputs: Vec<Arc<Output>>,
    subscriptions: RwLock<IndexMap<String, SubscriptionConfig>>,
    active: Mutex<HashMap<String, ActiveTarget>>,
    epoch: std::sync::atomic::AtomicU64,
    shutdown: ShutdownSignal,

    attempts: metrics::Metric<Counter>,
    failures: metrics::Metric<Counter>,
    malformed: metrics::Metric<Counter>,
}

impl TargetManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_name: String,
        cluster_name: Option<String>,
        locker: Option<SharedLocker>,
        connector: Arc<dyn Connector>,
        outputs: Vec<Arc<Output>>,
        subscriptions: IndexMap<String, SubscriptionConfig>,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            instance_name,
            cluster_name,
            locker,
            connector,
            outputs,
            subscriptions: RwLock::new(subscriptions),
            active: Mutex::new(HashMap::new()),
            epoch: std::sync::atomic::AtomicU64::new(0),
            shutdown,
            attempts: metrics::register_counter(
                "target_subscribe_attempts_total",
                "Subscribe attempts per target.",
            ),
            failures: metrics::register_counter(
                "target_subscribe_failures_total",
                "Failed subscribe attempts per target.",
            ),
            malformed: metrics::register_counter(
                "target_malformed_messages_total",
                "Notifications dropped because no value could be decoded.",
            ),
        })
    }

    fn target_key(&self, name: &str) -> Option<String> {
        self.cluster_name
            .as_ref()
            .map(|cluster| format!("gnmic/{}/targets/{}", cluster, name))
    }

    /// Subscriptions this target opens, resolved against the shared
    /// definitions.
    fn requests_for(&self, tc: &TargetConfig) -> crate::Result<Vec<SubscribeRequest>> {
        let subscriptions = self.subscriptions.read();

        let names: Vec<String> = if tc.subscriptions.is_empty() {
            subscriptions.keys().cloned().collect()
        } else {
            tc.subscriptions.clone()
        };

        let mut requests = Vec::with_capacity(names.len());
        for name in &names {
            let Some(sc) = subscriptions.get(name) else {
                return Err(format!("unknown subscription {name:?}").into());
            };

            let mut sc = sc.clone();
            sc.name = name.clone();
            if sc.encoding.is_none() {
                sc.encoding = tc.encoding;
            }

            requests.push(SubscribeRequest::build(&sc)?);
        }

        Ok(requests)
    }

    /// Start subscribing to `tc`, unless it is already running. In
    /// clustered mode the task first has to win the target lock.
    pub fn start_target(self: &Arc<Self>, tc: Arc<TargetConfig>) {
        let name = tc.name.clone();
        let mut active = self.active.lock();

        if active.contains_key(&name) {
            debug!(message = "target already running", target = %name);
            return;
        }

        let epoch = self
            .epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (stop_trigger, stop) = Tripwire::new();
        let state = Arc::new(Mutex::new(if self.locker.is_some() {
            TargetState::AcquiringLock
        } else {
            TargetState::Connecting
        }));

        active.insert(
            name.clone(),
            ActiveTarget {
                config: Arc::clone(&tc),
                stop: Some(stop_trigger),
                state: Arc::clone(&state),
                handle: None,
                epoch,
            },
        );
        drop(active);

        // the task runs under a supervisor: a panic must not strand the
        // target lock, or the leader would never re-dispatch it
        let manager = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            let inner = Arc::clone(&manager);
            let config = Arc::clone(&tc);
            let task =
                tokio::spawn(async move { inner.run_target(config, stop, state, epoch).await });

            if let Err(err) = task.await {
                if err.is_panic() {
                    error!(message = "target task panicked", target = %tc.name);

                    if let (Some(key), Some(locker)) =
                        (manager.target_key(&tc.name), manager.locker.as_ref())
                    {
                        if let Err(err) = locker.unlock(&key).await {
                            warn!(
                                message = "release lock of panicked target failed",
                                target = %tc.name,
                                %err,
                            );
                        }
                    }
                    manager.remove_active(&tc.name, epoch);
                }
            }
        });

        let mut active = self.active.lock();
        if let Some(entry) = active.get_mut(&name) {
            if entry.epoch == epoch {
                entry.handle = Some(supervisor);
            }
        }
        drop(active);

        info!(message = "target started", target = %name);
    }

    /// Stop the target's task and release its lock.
    pub fn stop_target(&self, name: &str) {
        let removed = self.active.lock().remove(name);

        if let Some(mut active) = removed {
            if let Some(stop) = active.stop.take() {
                stop.cancel();
            }
            info!(message = "target stopped", target = %name);
        }

        self.attempts.remove([("target", name.to_string())]);
        self.failures.remove([("target", name.to_string())]);
        self.malformed.remove([("target", name.to_string())]);
    }

    /// Close and reopen a running target, e.g. after its subscription
    /// set changed. There is no in-place patch.
    pub fn restart_target(self: &Arc<Self>, tc: Arc<TargetConfig>) {
        self.stop_target(&tc.name);
        self.start_target(tc);
    }

    /// Replace a subscription definition set (admin API).
    pub fn set_subscriptions(&self, subscriptions: IndexMap<String, SubscriptionConfig>) {
        *self.subscriptions.write() = subscriptions;
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.active.lock().contains_key(name)
    }

    pub fn running(&self) -> Vec<(String, TargetState)> {
        self.active
            .lock()
            .iter()
            .map(|(name, active)| (name.clone(), *active.state.lock()))
            .collect()
    }

    pub fn running_config(&self, name: &str) -> Option<Arc<TargetConfig>> {
        self.active
            .lock()
            .get(name)
            .map(|active| Arc::clone(&active.config))
    }

    /// Stop everything and wait for the tasks, so every held target lock
    /// is released before this returns.
    pub async fn stop_all(&self) {
        let entries: Vec<(String, ActiveTarget)> = self.active.lock().drain().collect();

        let mut handles = Vec::with_capacity(entries.len());
        for (name, mut entry) in entries {
            if let Some(stop) = entry.stop.take() {
                stop.cancel();
            }
            if let Some(handle) = entry.handle.take() {
                handles.push((name.clone(), handle));
            }

            self.attempts.remove([("target", name.clone())]);
            self.failures.remove([("target", name.clone())]);
            self.malformed.remove([("target", name)]);
        }

        for (name, handle) in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!(message = "target task did not stop in time", target = %name);
            }
        }
    }

    fn remove_active(&self, name: &str, epoch: u64) {
        let mut active = self.active.lock();
        if active.get(name).map(|entry| entry.epoch) == Some(epoch) {
            active.remove(name);
        }
    }

    async fn run_target(
        self: Arc<Self>,
        tc: Arc<TargetConfig>,
        mut stop: Tripwire,
        state: Arc<Mutex<TargetState>>,
        epoch: u64,
    ) {
        let mut shutdown = self.shutdown.clone();
        let key = self.target_key(&tc.name);

        // step 1: win the lock, bounded
        if let (Some(key), Some(locker)) = (&key, &self.locker) {
            let deadline = tokio::time::Instant::now() + LOCK_ACQUIRE_TIMEOUT;
            let mut backoff = backoff::ExponentialBackoff::from_millis(250)
                .factor(2)
                .max_delay(Duration::from_secs(5))
                .jitter();

            loop {
                match locker.lock(key, &self.instance_name).await {
                    Ok(true) => break,
                    Ok(false) => {
                        debug!(message = "target lock busy", target = %tc.name);
                    }
                    Err(err) => {
                        warn!(message = "target lock attempt failed", target = %tc.name, %err);
                    }
                }

                if tokio::time::Instant::now() >= deadline {
                    warn!(
                        message = "gave up acquiring target lock",
                        target = %tc.name,
                        timeout = ?LOCK_ACQUIRE_TIMEOUT,
                    );
                    self.remove_active(&tc.name, epoch);
                    return;
                }

                tokio::select! {
                    _ = &mut stop => return,
                    _ = &mut shutdown => return,
                    _ = backoff.wait() => {}
                }
            }
        }

        // lease losses arrive as a stream; without clustering it never fires
        let mut expirations: BoxStream<'static, String> = match &self.locker {
            Some(locker) => Box::pin(
                BroadcastStream::new(locker.expirations())
                    .filter_map(|item| async move { item.ok() })
                    .chain(stream::pending()),
            ),
            None => Box::pin(stream::pending()),
        };

        self.subscribe_loop(&tc, &mut stop, &mut shutdown, &mut expirations, &key, &state)
            .await;

        // release on the way out unless the lease already lapsed
        if let (Some(key), Some(locker)) = (&key, &self.locker) {
            if let Err(err) = locker.unlock(key).await {
                warn!(message = "release target lock failed", target = %tc.name, %err);
            }
        }

        self.remove_active(&tc.name, epoch);
    }

    async fn subscribe_loop(
        &self,
        tc: &Arc<TargetConfig>,
        stop: &mut Tripwire,
        shutdown: &mut ShutdownSignal,
        expirations: &mut BoxStream<'static, String>,
        key: &Option<String>,
        state: &Arc<Mutex<TargetState>>,
    ) {
        let attempts = self.attempts.recorder([("target", tc.name.clone())]);
        let failures = self.failures.recorder([("target", tc.name.clone())]);

        let mut backoff = backoff::ExponentialBackoff::from_interval(tc.retry_interval)
            .max_delay(MAX_RETRY_DELAY)
            .jitter();

        loop {
            *state.lock() = TargetState::Connecting;
            attempts.inc(1);

            let result = self.subscribe_once(tc, stop, shutdown, expirations, key, state);

            match result.await {
                SessionEnd::Stopped => return,
                SessionEnd::LockLost => {
                    info!(message = "target lock expired, shedding target", target = %tc.name);
                    return;
                }
                SessionEnd::Failed => {
                    failures.inc(1);
                    *state.lock() = TargetState::Backoff;

                    tokio::select! {
                        _ = &mut *stop => return,
                        _ = &mut *shutdown => return,
                        _ = backoff.wait() => {}
                    }
                }
                SessionEnd::Drained => {
                    // clean stream end, reconnect after the base interval
                    backoff.reset();
                    *state.lock() = TargetState::Backoff;

                    tokio::select! {
                        _ = &mut *stop => return,
                        _ = &mut *shutdown => return,
                        _ = backoff.wait() => {}
                    }
                }
            }
        }
    }

    /// One connect-subscribe-forward session. Returns why it ended.
    async fn subscribe_once(
        &self,
        tc: &Arc<TargetConfig>,
        stop: &mut Tripwire,
        shutdown: &mut ShutdownSignal,
        expirations: &mut BoxStream<'static, String>,
        key: &Option<String>,
        state: &Arc<Mutex<TargetState>>,
    ) -> SessionEnd {
        let requests = match self.requests_for(tc) {
            Ok(requests) => requests,
            Err(err) => {
                error!(message = "building subscribe requests failed", target = %tc.name, %err);
                return SessionEnd::Failed;
            }
        };

        let channel = tokio::select! {
            _ = &mut *stop => return SessionEnd::Stopped,
            _ = &mut *shutdown => return SessionEnd::Stopped,
            connected = self.connector.connect(tc) => match connected {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(message = "connect failed", target = %tc.name, %err);
                    return SessionEnd::Failed;
                }
            }
        };

        let mut streams = Vec::with_capacity(requests.len());
        for request in requests {
            let name = request.name.clone();
            match channel.subscribe(request).await {
                Ok(stream) => streams.push(stream.map(move |item| (name.clone(), item))),
                Err(err) => {
                    warn!(
                        message = "subscribe failed",
                        target = %tc.name,
                        subscription = %name,
                        %err,
                    );
                    return SessionEnd::Failed;
                }
            }
        }

        *state.lock() = TargetState::Running;

        let mut merged = select_all(streams);
        let meta = IndexMap::from([("source".to_string(), tc.address.clone())]);

        loop {
            let (subscription, item) = tokio::select! {
                _ = &mut *stop => return SessionEnd::Stopped,
                _ = &mut *shutdown => return SessionEnd::Stopped,
                lost = expirations.next() => {
                    match (lost, key) {
                        (Some(lost), Some(key)) if lost.as_str() == key => {
                            return SessionEnd::LockLost;
                        }
                        _ => continue,
                    }
                }
                next = merged.next() => match next {
                    Some(item) => item,
                    None => return SessionEnd::Drained,
                },
            };

            match item {
                Ok(SubscribeResponse::Update(notification)) => {
                    let events = events_from_notification(&subscription, &notification, &meta);
                    if events.is_empty() {
                        // a message we could not decode is dropped, counted,
                        // and the stream carries on
                        if !notification.updates.is_empty() {
                            self.malformed
                                .recorder([("target", tc.name.clone())])
                                .inc(1);
                        }
                        continue;
                    }

                    for output in &self.outputs {
                        output.write_events(events.clone()).await;
                    }
                }
                Ok(SubscribeResponse::SyncResponse(done)) => {
                    debug!(message = "sync response", target = %tc.name, done);
                }
                Err(err) => {
                    warn!(message = "subscription stream error", target = %tc.name, %err);
                    return SessionEnd::Failed;
                }
            }
        }
    }
}

enum SessionEnd {
    Stopped,
    LockLost,
    Failed,
    Drained,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::mem::MemBackend;
    use crate::coordination::Locker;
    use crate::testing::{MockConnector, OutputProbe};

    fn target(name: &str) -> Arc<TargetConfig> {
        Arc::new(TargetConfig {
            name: name.to_string(),
            address: format!("{name}:57400"),
            retry_interval: Duration::from_millis(10),
            ..Default::default()
        })
    }

    fn subscriptions() -> IndexMap<String, SubscriptionConfig> {
        IndexMap::from([(
            "port-stats".to_string(),
            SubscriptionConfig {
                name: "port-stats".into(),
                paths: vec!["/interfaces/interface/state/counters".into()],
                ..Default::default()
            },
        )])
    }

    #[tokio::test]
    async fn events_flow_to_outputs_in_order() {
        let connector = MockConnector::new();
        connector.push_notifications("t1", (0..10).map(|i| (i, i as u64)).collect());

        let (probe, output) = OutputProbe::output("out").await;
        let manager = TargetManager::new(
            "collector-1".into(),
            None,
            None,
            Arc::new(connector),
            vec![output],
            subscriptions(),
            ShutdownSignal::noop(),
        );

        manager.start_target(target("t1"));

        let events = probe.wait_for(10).await;
        let timestamps: Vec<i64> = events.iter().map(|event| event.timestamp).collect();
        assert_eq!(timestamps, (0..10).collect::<Vec<i64>>());

        // events carry the source tag and the subscription name
        assert_eq!(events[0].name, "port-stats");
        assert_eq!(events[0].tags["source"], "t1:57400");

        manager.stop_target("t1");
        assert!(!manager.is_running("t1"));
    }

    #[tokio::test]
    async fn reconnects_after_stream_error() {
        let connector = MockConnector::new();
        connector.fail_next_subscribes("t1", 2);
        connector.push_notifications("t1", vec![(1, 1)]);

        let (probe, output) = OutputProbe::output("out").await;
        let manager = TargetManager::new(
            "collector-1".into(),
            None,
            None,
            Arc::new(connector.clone()),
            vec![output],
            subscriptions(),
            ShutdownSignal::noop(),
        );

        manager.start_target(target("t1"));

        let events = probe.wait_for(1).await;
        assert_eq!(events[0].timestamp, 1);
        assert!(connector.subscribe_count("t1") >= 3);
    }

    #[tokio::test]
    async fn lock_expiry_sheds_target() {
        let backend = MemBackend::new(Duration::from_secs(10));
        let locker: SharedLocker = Arc::new(backend.handle());

        let connector = MockConnector::new();
        connector.keep_streaming("t1");

        let (_probe, output) = OutputProbe::output("out").await;
        let manager = TargetManager::new(
            "collector-1".into(),
            Some("lab".into()),
            Some(locker.clone()),
            Arc::new(connector),
            vec![output],
            subscriptions(),
            ShutdownSignal::noop(),
        );

        manager.start_target(target("t1"));

        // wait for the lock to be held
        let key = "gnmic/lab/targets/t1";
        for _ in 0..100 {
            if backend.holder(key).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.holder(key).as_deref(), Some("collector-1"));

        backend.force_expire(key);

        for _ in 0..100 {
            if !manager.is_running("t1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.is_running("t1"));
    }

    #[tokio::test]
    async fn second_instance_cannot_start_locked_target() {
        let backend = MemBackend::new(Duration::from_secs(10));
        let holder = backend.handle();
        assert!(holder
            .lock("gnmic/lab/targets/t1", "other")
            .await
            .unwrap());

        let connector = MockConnector::new();
        connector.keep_streaming("t1");

        let (probe, output) = OutputProbe::output("out").await;
        let manager = TargetManager::new(
            "collector-1".into(),
            Some("lab".into()),
            Some(Arc::new(backend.handle())),
            Arc::new(connector),
            vec![output],
            subscriptions(),
            ShutdownSignal::noop(),
        );

        manager.start_target(target("t1"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        // the subscription never started, the lock holder did not change
        assert!(probe.events().is_empty());
        assert_eq!(
            backend.holder("gnmic/lab/targets/t1").as_deref(),
            Some("other")
        );
    }
}
