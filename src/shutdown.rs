use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use tokio::time::{timeout_at, Instant};
use tripwire::{Trigger, Tripwire};

/// Hands a [`ShutdownSignal`] to every long-running task and waits for all
/// of them to finish once shutdown begins.
#[derive(Default)]
pub struct ShutdownCoordinator {
    begun_triggers: HashMap<String, Trigger>,
    complete_tripwires: HashMap<String, Tripwire>,
}

impl ShutdownCoordinator {
    /// Create the trigger/tripwire pair for one named task and keep the
    /// bookkeeping ends here.
    pub fn register(&mut self, name: impl Into<String>) -> ShutdownSignal {
        let name = name.into();
        let (begun_trigger, begun_tripwire) = Tripwire::new();
        let (complete_trigger, complete_tripwire) = Tripwire::new();

        self.begun_triggers.insert(name.clone(), begun_trigger);
        self.complete_tripwires.insert(name, complete_tripwire);

        ShutdownSignal::new(begun_tripwire, complete_trigger)
    }

    /// A begin-only signal for components whose teardown is awaited
    /// explicitly; it carries no completion token, so a long-lived owner
    /// (a manager struct, a coordinator) can hold it without stalling
    /// [`ShutdownCoordinator::shutdown_all`].
    pub fn watcher(&mut self, name: impl Into<String>) -> ShutdownSignal {
        let (begun_trigger, begun_tripwire) = Tripwire::new();
        self.begun_triggers.insert(name.into(), begun_trigger);

        ShutdownSignal {
            begin: begun_tripwire,
            _complete: None,
        }
    }

    /// Signal every registered task to begin shutting down and wait until
    /// they all finished or the deadline passed. Returns false when some
    /// task had to be abandoned.
    pub async fn shutdown_all(self, deadline: Instant) -> bool {
        for (_name, trigger) in self.begun_triggers {
            trigger.cancel();
        }

        let mut clean = true;
        for (name, tripwire) in self.complete_tripwires {
            if timeout_at(deadline, tripwire).await.is_err() {
                error!(
                    message = "task failed to shut down before deadline, abandoning it",
                    component = %name,
                );
                clean = false;
            }
        }

        clean
    }
}

/// Resolves (repeatedly) once global shutdown begins. Completion is
/// reported to the coordinator when the last clone of this signal drops,
/// which is when the task holding it actually finished.
#[derive(Clone)]
pub struct ShutdownSignal {
    begin: Tripwire,
    _complete: Option<Arc<Trigger>>,
}

impl std::future::Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.begin.poll_unpin(cx)
    }
}

impl ShutdownSignal {
    pub fn new(tripwire: Tripwire, trigger: Trigger) -> Self {
        Self {
            begin: tripwire,
            _complete: Some(Arc::new(trigger)),
        }
    }

    /// Whether shutdown already began, without registering for wakeup.
    pub fn is_shutdown(&self) -> bool {
        self.begin.fired()
    }

    /// A signal that never fires and reports to nobody.
    pub fn noop() -> Self {
        let (trigger, tripwire) = Tripwire::new();
        trigger.disable();

        Self {
            begin: tripwire,
            _complete: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_clean() {
        let mut coordinator = ShutdownCoordinator::default();
        let mut signal = coordinator.register("test");

        let handle = tokio::spawn(async move {
            (&mut signal).await;
            // completion is reported when `signal` drops here
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(coordinator.shutdown_all(deadline).await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_forced_when_task_hangs() {
        let mut coordinator = ShutdownCoordinator::default();
        let signal = coordinator.register("test");

        // never dropped, so completion is never reported
        std::mem::forget(signal);

        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!coordinator.shutdown_all(deadline).await);
    }

    #[tokio::test]
    async fn resolves_repeatedly_after_firing() {
        let mut coordinator = ShutdownCoordinator::default();
        let mut signal = coordinator.register("test");

        assert!(!signal.is_shutdown());

        let waiter = tokio::spawn(async move {
            (&mut signal).await;
            // a second await must not hang; the signal stays resolved
            (&mut signal).await;
            assert!(signal.is_shutdown());
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        coordinator.shutdown_all(deadline).await;
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn clone_observes_shutdown() {
        let mut coordinator = ShutdownCoordinator::default();
        let signal = coordinator.register("test");
        let mut observer = signal.clone();

        let task = tokio::spawn(async move {
            (&mut observer).await;
            assert!(observer.is_shutdown());
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        drop(signal);
        coordinator.shutdown_all(deadline).await;
        task.await.unwrap();
    }
}
