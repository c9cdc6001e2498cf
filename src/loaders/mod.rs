//! Target loaders: lazily produced, restartable streams of
//! [`TargetOperation`] snapshots feeding the coordinator.
//!
//! Every loader emits an initial pure-add snapshot after start and then the
//! diff against the previous snapshot. Transient refresh failures are
//! retried on the loader's interval and never emit synthetic deletes.

pub mod dns;
pub mod file;
pub mod http;
pub mod registry;
pub mod static_targets;

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::TargetConfig;
use crate::coordination::SharedLocker;
use crate::shutdown::ShutdownSignal;

/// One batch of changes to the target fleet. Empty maps are legal.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetOperation {
    pub add: HashMap<String, TargetConfig>,
    pub del: Vec<String>,
}

impl TargetOperation {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty()
    }
}

/// Diff two snapshots. Equality is deep and order-sensitive for list
/// fields, so a tag reorder shows up as delete-then-add of the same name.
pub fn diff(
    prev: &HashMap<String, TargetConfig>,
    next: &HashMap<String, TargetConfig>,
) -> TargetOperation {
    let mut op = TargetOperation::default();

    for (name, tc) in next {
        match prev.get(name) {
            Some(old) if old == tc => {}
            _ => {
                op.add.insert(name.clone(), tc.clone());
            }
        }
    }

    for (name, tc) in prev {
        match next.get(name) {
            Some(new) if new == tc => {}
            _ => op.del.push(name.clone()),
        }
    }

    op.del.sort();
    op
}

pub type Loader = BoxFuture<'static, Result<(), ()>>;

pub struct LoaderContext {
    pub out: mpsc::Sender<TargetOperation>,
    pub shutdown: ShutdownSignal,

    /// Present when clustering is on; the registry loader needs it.
    pub locker: Option<SharedLocker>,
}

/// Registry of loader kinds, keyed by the `type` field of the `loader`
/// config section.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait LoaderConfig: Debug + Send + Sync {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader>;
}

/// Ensure every config in a snapshot knows its own name.
fn name_targets(mut targets: HashMap<String, TargetConfig>) -> HashMap<String, TargetConfig> {
    for (name, tc) in targets.iter_mut() {
        if tc.name.is_empty() {
            tc.name = name.clone();
        }
        if tc.address.is_empty() {
            tc.address = name.clone();
        }
    }
    targets
}

/// The shared poll loop: fetch a full snapshot on every interval, emit the
/// diff. Consumers see one operation at a time through the bounded channel.
async fn run_poll_loop<F, Fut>(
    kind: &'static str,
    interval: Duration,
    mut fetch: F,
    out: mpsc::Sender<TargetOperation>,
    mut shutdown: ShutdownSignal,
) -> Result<(), ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<HashMap<String, TargetConfig>>>,
{
    let mut known: Option<HashMap<String, TargetConfig>> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            _ = ticker.tick() => {}
        }

        let snapshot = match fetch().await {
            Ok(snapshot) => name_targets(snapshot),
            Err(err) => {
                // keep the previous snapshot, a failed refresh is not a delete
                warn!(message = "target refresh failed", loader = kind, %err);
                continue;
            }
        };

        let op = match &known {
            Some(prev) => diff(prev, &snapshot),
            None => TargetOperation {
                add: snapshot.clone(),
                del: Vec::new(),
            },
        };

        let initial = known.is_none();
        known = Some(snapshot);

        // the initial snapshot is always emitted, even when empty
        if op.is_empty() && !initial {
            continue;
        }

        if out.send(op).await.is_err() {
            return Ok(());
        }
    }
}
