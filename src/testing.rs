//! In-process fakes shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::TargetConfig;
use crate::event::EventMsg;
use crate::gnmi::{
    xpath, Channel, Connector, Notification, SubscribeRequest, SubscribeResponse, SubscribeStream,
    TypedValue, Update,
};
use crate::outputs::{Output, Sink};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

/// A free local address for a short-lived listener.
pub fn next_addr() -> std::net::SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind an ephemeral port");
    listener.local_addr().expect("listener has an address")
}

#[derive(Default)]
struct MockTarget {
    notifications: Vec<Notification>,
    fail_subscribes: usize,
    keep_streaming: bool,
    subscribe_count: usize,
}

/// Scripted gNMI endpoints, one per target name.
#[derive(Clone, Default)]
pub struct MockConnector {
    targets: Arc<Mutex<HashMap<String, MockTarget>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `(timestamp, value)` update notifications for a target.
    pub fn push_notifications(&self, target: &str, samples: Vec<(i64, u64)>) {
        let mut targets = self.targets.lock();
        let entry = targets.entry(target.to_string()).or_default();

        for (timestamp, value) in samples {
            entry.notifications.push(Notification {
                timestamp,
                prefix: None,
                updates: vec![Update {
                    path: xpath::parse("/interfaces/interface/state/counters/in-octets")
                        .expect("static path parses"),
                    value: TypedValue::Uint(value),
                }],
                deletes: vec![],
            });
        }
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, target: &str, count: usize) {
        self.targets
            .lock()
            .entry(target.to_string())
            .or_default()
            .fail_subscribes = count;
    }

    /// Keep the stream open after the queued notifications drain.
    pub fn keep_streaming(&self, target: &str) {
        self.targets
            .lock()
            .entry(target.to_string())
            .or_default()
            .keep_streaming = true;
    }

    pub fn subscribe_count(&self, target: &str) -> usize {
        self.targets
            .lock()
            .get(target)
            .map(|entry| entry.subscribe_count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &TargetConfig) -> crate::Result<Box<dyn Channel>> {
        Ok(Box::new(MockChannel {
            target: target.name.clone(),
            targets: Arc::clone(&self.targets),
        }))
    }
}

struct MockChannel {
    target: String,
    targets: Arc<Mutex<HashMap<String, MockTarget>>>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn subscribe(&self, _request: SubscribeRequest) -> crate::Result<SubscribeStream> {
        let mut targets = self.targets.lock();
        let entry = targets.entry(self.target.clone()).or_default();

        if entry.fail_subscribes > 0 {
            entry.fail_subscribes -= 1;
            return Err("scripted subscribe failure".into());
        }

        entry.subscribe_count += 1;

        let items: Vec<crate::Result<SubscribeResponse>> = std::mem::take(
            &mut entry.notifications,
        )
        .into_iter()
        .map(|notification| Ok(SubscribeResponse::Update(notification)))
        .collect();

        let head = stream::iter(items);
        if entry.keep_streaming {
            Ok(head.chain(stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }
}

/// Collects whatever producers push into a bare output.
pub struct OutputProbe {
    events: Arc<Mutex<Vec<EventMsg>>>,
}

impl OutputProbe {
    pub async fn output(name: &str) -> (OutputProbe, Arc<Output>) {
        let (output, mut rx) = Output::new_test(name);
        let events: Arc<Mutex<Vec<EventMsg>>> = Arc::default();

        let sink = Arc::clone(&events);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.lock().push(event);
            }
        });

        (OutputProbe { events }, output)
    }

    pub fn events(&self) -> Vec<EventMsg> {
        self.events.lock().clone()
    }

    /// Block until at least `count` events arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<EventMsg> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;

        loop {
            let events = self.events();
            if events.len() >= count {
                return events;
            }

            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} events, got {}",
                events.len()
            );
            tokio::time::sleep(POLL).await;
        }
    }
}

/// A sink that records every batch and can be flipped unhealthy.
#[derive(Default)]
pub struct RecordingSink {
    healthy: AtomicBool,
    health_failures: AtomicUsize,
    batches: Mutex<Vec<Vec<EventMsg>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            health_failures: AtomicUsize::new(0),
            batches: Mutex::default(),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<Vec<EventMsg>> {
        self.batches.lock().clone()
    }

    fn event_count(&self) -> usize {
        self.batches.lock().iter().map(Vec::len).sum()
    }

    pub async fn wait_for_batches(&self, count: usize) {
        wait_until(|| self.batches.lock().len() >= count, "batches").await;
    }

    pub async fn wait_for_events(&self, count: usize) {
        wait_until(|| self.event_count() >= count, "events").await;
    }

    pub async fn wait_for_health_failures(&self, count: usize) {
        wait_until(
            || self.health_failures.load(Ordering::SeqCst) >= count,
            "health failures",
        )
        .await;
    }
}

async fn wait_until(mut predicate: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;

    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(POLL).await;
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write_batch(&self, batch: Vec<EventMsg>) -> crate::Result<()> {
        self.batches.lock().push(batch);
        Ok(())
    }

    async fn healthy(&self) -> crate::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            self.health_failures.fetch_add(1, Ordering::SeqCst);
            Err("scripted unhealthy".into())
        }
    }
}
