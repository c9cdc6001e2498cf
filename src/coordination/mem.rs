//! In-process coordination backend.
//!
//! Leases expire only through explicit [`MemBackend::tick`] virtual time,
//! never the wall clock, so cluster tests are deterministic. A handle that
//! was [`MemLocker::kill`]ed stops renewing and its leases lapse one TTL
//! later; [`Locker::stop`] releases everything immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use super::{
    CoordinationError, Locker, LockerConfig, ServiceEntry, ServiceRegistration, SharedLocker,
};

const DEFAULT_TTL: Duration = Duration::from_secs(10);

struct LockEntry {
    value: String,
    session: u64,
    expires_at: Duration,
}

struct ServiceRecord {
    entry: ServiceEntry,
    session: u64,
    expires_at: Duration,
}

struct Session {
    alive: bool,
    expired_tx: broadcast::Sender<String>,
}

#[derive(Default)]
struct State {
    now: Duration,
    next_session: u64,
    locks: HashMap<String, LockEntry>,
    services: HashMap<String, ServiceRecord>,
    sessions: HashMap<u64, Session>,
    watches: Vec<(String, mpsc::Sender<()>)>,
    /// Sessions whose lease on a key was invalidated: they cannot re-grab
    /// that key, the way a registry's lock-delay fences a lapsed holder.
    barred: HashMap<String, u64>,
}

impl State {
    fn notify_watches(&mut self, key: &str) {
        self.watches.retain(|(prefix, tx)| {
            if !key.starts_with(prefix.as_str()) {
                return true;
            }

            match tx.try_send(()) {
                Ok(()) => true,
                // a pending nudge is already queued
                Err(mpsc::error::TrySendError::Full(())) => true,
                Err(mpsc::error::TrySendError::Closed(())) => false,
            }
        });
    }
}

/// The shared service; every instance in a test talks to the same backend
/// through its own [`MemLocker`] handle.
pub struct MemBackend {
    ttl: Duration,
    state: Mutex<State>,
}

impl MemBackend {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            state: Mutex::new(State::default()),
        })
    }

    pub fn handle(self: &Arc<Self>) -> MemLocker {
        let (expired_tx, _) = broadcast::channel(64);

        let session = {
            let mut state = self.state.lock();
            state.next_session += 1;
            let id = state.next_session;
            state.sessions.insert(
                id,
                Session {
                    alive: true,
                    expired_tx: expired_tx.clone(),
                },
            );
            id
        };

        MemLocker {
            backend: Arc::clone(self),
            session,
            expired_tx,
        }
    }

    /// Advance virtual time. Live sessions renew their leases; leases of
    /// dead sessions lapse once their TTL has elapsed.
    pub fn tick(&self, dt: Duration) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.now += dt;
        let now = state.now;
        let ttl = self.ttl;

        let mut removed = Vec::new();
        for (key, entry) in state.locks.iter_mut() {
            let alive = state
                .sessions
                .get(&entry.session)
                .map(|s| s.alive)
                .unwrap_or(false);

            if alive {
                entry.expires_at = now + ttl;
            } else if now >= entry.expires_at {
                removed.push(key.clone());
            }
        }
        for key in &removed {
            state.locks.remove(key);
        }

        let mut dropped_services = Vec::new();
        for (id, record) in state.services.iter_mut() {
            let alive = state
                .sessions
                .get(&record.session)
                .map(|s| s.alive)
                .unwrap_or(false);

            if alive {
                record.expires_at = now + ttl;
            } else if now >= record.expires_at {
                dropped_services.push(id.clone());
            }
        }
        for id in dropped_services {
            state.services.remove(&id);
        }

        for key in removed {
            state.notify_watches(&key);
        }
    }

    /// Synchronous view of the lock table under a prefix, for assertions.
    pub fn locks(&self, prefix: &str) -> HashMap<String, String> {
        self.state
            .lock()
            .locks
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Current holder value of a lock, if any.
    pub fn holder(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .locks
            .get(key)
            .map(|entry| entry.value.clone())
    }

    /// Force-release a lock while its owner still lives, delivering the
    /// loss on the owner's expiration channel. Models a lapsed lease.
    pub fn force_expire(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.locks.remove(key) {
            if let Some(session) = state.sessions.get(&entry.session) {
                let _ = session.expired_tx.send(key.to_string());
            }
            state.barred.insert(key.to_string(), entry.session);
            state.notify_watches(key);
        }
    }
}

/// One instance's handle onto the backend.
pub struct MemLocker {
    backend: Arc<MemBackend>,
    session: u64,
    expired_tx: broadcast::Sender<String>,
}

impl MemLocker {
    /// Simulate a crash: leases stop renewing but stay visible until their
    /// TTL lapses on a later tick.
    pub fn kill(&self) {
        let mut state = self.backend.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.session) {
            session.alive = false;
        }
    }
}

#[async_trait]
impl Locker for MemLocker {
    async fn lock(&self, key: &str, value: &str) -> Result<bool, CoordinationError> {
        let mut state = self.backend.state.lock();

        let alive = state
            .sessions
            .get(&self.session)
            .map(|s| s.alive)
            .unwrap_or(false);
        if !alive {
            return Err(CoordinationError::Transient("session is gone".into()));
        }

        match state.locks.get(key) {
            Some(entry) if entry.session != self.session => return Ok(false),
            _ => {}
        }
        if state.barred.get(key) == Some(&self.session) {
            return Ok(false);
        }

        state.barred.remove(key);
        let expires_at = state.now + self.backend.ttl;
        state.locks.insert(
            key.to_string(),
            LockEntry {
                value: value.to_string(),
                session: self.session,
                expires_at,
            },
        );
        state.notify_watches(key);

        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<(), CoordinationError> {
        let mut state = self.backend.state.lock();

        let owned = state
            .locks
            .get(key)
            .map(|entry| entry.session == self.session)
            .unwrap_or(false);
        if owned {
            state.locks.remove(key);
            state.notify_watches(key);
        }

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>, CoordinationError> {
        let state = self.backend.state.lock();

        Ok(state
            .locks
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn get_services(
        &self,
        name: &str,
        tag_filters: &[String],
    ) -> Result<Vec<ServiceEntry>, CoordinationError> {
        let state = self.backend.state.lock();

        let mut entries = state
            .services
            .values()
            .filter(|record| record.entry.name == name)
            .filter(|record| {
                state
                    .sessions
                    .get(&record.session)
                    .map(|s| s.alive)
                    .unwrap_or(false)
            })
            .filter(|record| {
                tag_filters
                    .iter()
                    .all(|filter| record.entry.tags.contains(filter))
            })
            .map(|record| record.entry.clone())
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn register(&self, service: ServiceRegistration) -> Result<(), CoordinationError> {
        let mut state = self.backend.state.lock();
        let expires_at = state.now + self.backend.ttl;

        state.services.insert(
            service.id.clone(),
            ServiceRecord {
                entry: ServiceEntry {
                    id: service.id,
                    name: service.name,
                    address: service.address,
                    tags: service.tags,
                },
                session: self.session,
                expires_at,
            },
        );

        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), CoordinationError> {
        self.backend.state.lock().services.remove(id);
        Ok(())
    }

    fn expirations(&self) -> broadcast::Receiver<String> {
        self.expired_tx.subscribe()
    }

    async fn watch(&self, prefix: &str) -> Option<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(16);
        self.backend
            .state
            .lock()
            .watches
            .push((prefix.to_string(), tx));
        Some(rx)
    }

    async fn stop(&self) {
        let mut state = self.backend.state.lock();

        if let Some(session) = state.sessions.get_mut(&self.session) {
            session.alive = false;
        }

        let released: Vec<String> = state
            .locks
            .iter()
            .filter(|(_, entry)| entry.session == self.session)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &released {
            state.locks.remove(key);
        }
        state
            .services
            .retain(|_, record| record.session != self.session);

        for key in released {
            state.notify_watches(&key);
        }
    }
}

/// Process-wide backends addressable by name, so several instances built
/// in one process (tests, simulations) can share a coordination service.
static SHARED: std::sync::OnceLock<Mutex<HashMap<String, Arc<MemBackend>>>> =
    std::sync::OnceLock::new();

pub fn shared_backend(key: &str, ttl: Duration) -> Arc<MemBackend> {
    let mut registry = SHARED.get_or_init(Default::default).lock();
    Arc::clone(
        registry
            .entry(key.to_string())
            .or_insert_with(|| MemBackend::new(ttl)),
    )
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct MemLockerConfig {
    /// Name of a process-shared backend; absent means a private one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<String>,

    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub session_ttl: Duration,
}

const fn default_ttl() -> Duration {
    DEFAULT_TTL
}

#[async_trait]
#[typetag::serde(name = "mem")]
impl LockerConfig for MemLockerConfig {
    async fn build(&self) -> crate::Result<SharedLocker> {
        let ttl = if self.session_ttl.is_zero() {
            DEFAULT_TTL
        } else {
            self.session_ttl
        };

        let backend = match &self.shared_key {
            Some(key) => shared_backend(key, ttl),
            None => MemBackend::new(ttl),
        };

        Ok(Arc::new(backend.handle()))
    }
}
