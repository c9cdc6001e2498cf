#![deny(clippy::pedantic)]

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct State {
    cancelled: bool,
    next_id: u64,

    // each receiver holds an id, and when the receiver drops the
    // waker is removed from this map.
    wakers: HashMap<u64, Waker>,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn cancelled(&self) -> bool {
        self.state.lock().expect("lock tripwire state").cancelled
    }

    fn cancel(&self) {
        let wakers = {
            let mut state = self.state.lock().expect("lock tripwire state");
            state.cancelled = true;
            std::mem::take(&mut state.wakers)
        };

        wakers.into_values().for_each(Waker::wake);
    }

    fn next_id(&self) -> u64 {
        let mut state = self.state.lock().expect("lock tripwire state");
        state.next_id += 1;
        state.next_id
    }
}

/// A handle to a set of cancellable tripwire.
///
/// If the `Trigger` is dropped, any tripwire associated with it are resolved
/// (this is equivalent to calling [`Trigger::cancel`]). To override this
/// behavior, call [`Trigger::disable`].
pub struct Trigger {
    shared: Option<Arc<Shared>>,
}

impl Trigger {
    /// Cancel all associated tripwire, make them immediately resolved.
    pub fn cancel(self) {
        drop(self);
    }

    /// Disable the `Trigger`, and leave all associated `Tripwire` pending forever.
    pub fn disable(mut self) {
        self.shared.take();
        drop(self);
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.cancel();
        }
    }
}

/// A `Tripwire` is a convenient mechanism for implementing graceful shutdown
/// over many asynchronous tasks. A `Tripwire` is a `Future` that is `Clone`,
/// and that can be passed to `StreamExt::take_until` or polled in a `select!`.
/// All `Tripwire` clones are associated with the same [`Trigger`], which is
/// then used to signal that all the associated tasks should wind down.
///
/// The `Tripwire` future resolves once the trigger fired.
pub struct Tripwire {
    /// id of the waker slot in `Shared`.
    id: u64,

    shared: Arc<Shared>,
}

impl Clone for Tripwire {
    fn clone(&self) -> Self {
        let shared = Arc::clone(&self.shared);
        let id = shared.next_id();

        Self { id, shared }
    }
}

impl Drop for Tripwire {
    fn drop(&mut self) {
        // the slot only exists if this clone was polled at least once
        self.shared
            .state
            .lock()
            .expect("lock tripwire state")
            .wakers
            .remove(&self.id);
    }
}

impl Future for Tripwire {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock().expect("lock tripwire state");
        if state.cancelled {
            return Poll::Ready(());
        }

        // Register the current waker so the `Trigger` can wake this task.
        // The `Tripwire` can move between tasks on the executor, so the slot
        // is overwritten on every poll rather than inserted once.
        state.wakers.insert(self.id, cx.waker().clone());

        Poll::Pending
    }
}

impl Tripwire {
    #[must_use]
    /// Make a new `Tripwire` and an associated [`Trigger`].
    pub fn new() -> (Trigger, Tripwire) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                cancelled: false,
                next_id: 0,
                wakers: HashMap::default(),
            }),
        });

        (
            Trigger {
                shared: Some(Arc::clone(&shared)),
            },
            Tripwire {
                id: shared.next_id(),
                shared,
            },
        )
    }

    /// Whether the trigger already fired, without registering for wakeup.
    #[must_use]
    pub fn fired(&self) -> bool {
        self.shared.cancelled()
    }
}
