//! Cluster membership and work assignment.
//!
//! Every instance runs a coordinator: it registers itself in the service
//! registry and campaigns for the leader lock. The leader reconciles on a
//! watch timer: every configured target that nobody holds is dispatched to
//! the least-loaded eligible instance, which then takes the target lock
//! itself. Losing leadership is a transition back to follower, never an
//! error; running subscriptions stay where they are until the new leader
//! says otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::Request;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;

use futures::stream::{self, BoxStream, StreamExt};

use crate::config::{ClusteringConfig, TargetConfig, TargetStore};
use crate::coordination::{ServiceEntry, ServiceRegistration, SharedLocker};
use crate::http::{body, HttpClient};
use crate::shutdown::ShutdownSignal;
use crate::targets::TargetManager;

const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LOOP_BACKOFF: Duration = Duration::from_secs(60);

/// Affinity tag: a target carrying `instance-name=x` only ever lands on
/// instance `x`.
const AFFINITY_TAG: &str = "instance-name=";

/// An instance may advertise `capacity=n` in its service tags to bound how
/// many targets it accepts.
const CAPACITY_TAG: &str = "capacity=";

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterMember {
    pub name: String,
    pub api_endpoint: String,
    pub is_leader: bool,
    pub number_of_locked_targets: usize,
    pub locked_targets: Vec<String>,
}

pub struct ClusterCoordinator {
    cluster_name: String,
    instance_name: String,
    /// Address other instances can reach this one's admin API on.
    api_address: String,
    protocol: &'static str,
    tags: Vec<String>,

    locker: SharedLocker,
    manager: Arc<TargetManager>,
    targets: TargetStore,
    client: HttpClient,

    targets_watch_timer: Duration,
    leader_wait_timer: Duration,
    rebalance_slack: usize,

    /// Serializes assignment, rebalance and drain on the leader.
    dispatch_lock: tokio::sync::Mutex<()>,
    is_leader: AtomicBool,
    drained: Mutex<HashSet<String>>,

    shutdown: ShutdownSignal,
}

impl ClusterCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ClusteringConfig,
        instance_name: String,
        api_address: String,
        secure_api: bool,
        locker: SharedLocker,
        manager: Arc<TargetManager>,
        targets: TargetStore,
        shutdown: ShutdownSignal,
    ) -> crate::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            cluster_name: config.cluster_name.clone(),
            instance_name,
            api_address,
            protocol: if secure_api { "https" } else { "http" },
            tags: config.tags.clone(),
            locker,
            manager,
            targets,
            client: HttpClient::new(None)?,
            targets_watch_timer: config.targets_watch_timer,
            leader_wait_timer: config.leader_wait_timer,
            rebalance_slack: config.rebalance_slack,
            dispatch_lock: tokio::sync::Mutex::new(()),
            is_leader: AtomicBool::new(false),
            drained: Mutex::new(HashSet::new()),
            shutdown,
        }))
    }

    pub fn leader_key(&self) -> String {
        format!("gnmic/{}/leader", self.cluster_name)
    }

    fn targets_prefix(&self) -> String {
        format!("gnmic/{}/targets/", self.cluster_name)
    }

    fn service_name(&self) -> String {
        format!("{}-gnmic-api", self.cluster_name)
    }

    fn service_id(&self) -> String {
        format!("{}-api", self.instance_name)
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Register this instance and start campaigning.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        let mut tags = vec![
            format!("instance-name={}", self.instance_name),
            format!("protocol={}", self.protocol),
        ];
        tags.extend(self.tags.iter().cloned());

        self.locker
            .register(ServiceRegistration {
                id: self.service_id(),
                name: self.service_name(),
                address: self.api_address.clone(),
                tags,
                check_url: format!(
                    "{}://{}/api/v1/healthz",
                    self.protocol, self.api_address
                ),
            })
            .await?;

        let coordinator = Arc::clone(self);
        tokio::spawn(coordinator.campaign());

        Ok(())
    }

    /// Follower -> Leader -> Follower, forever.
    async fn campaign(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let leader_key = self.leader_key();

        loop {
            match self.locker.lock(&leader_key, &self.instance_name).await {
                Ok(true) => {
                    info!(message = "leader lock acquired", instance = %self.instance_name);
                    self.is_leader.store(true, Ordering::SeqCst);

                    self.lead().await;

                    self.is_leader.store(false, Ordering::SeqCst);
                    info!(message = "leadership lost", instance = %self.instance_name);
                }
                Ok(false) => {
                    trace!(message = "leader lock busy");
                }
                Err(err) => {
                    warn!(message = "leader lock attempt failed", %err);
                }
            }

            if shutdown.is_shutdown() {
                return;
            }

            tokio::select! {
                _ = &mut shutdown => return,
                _ = tokio::time::sleep(self.leader_wait_timer) => {}
            }
        }
    }

    /// The leader's dispatch loop. Returns when leadership lapses.
    async fn lead(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let leader_key = self.leader_key();

        let mut expirations: BoxStream<'static, String> = Box::pin(
            BroadcastStream::new(self.locker.expirations())
                .filter_map(|item| async move { item.ok() })
                .chain(stream::pending()),
        );

        // change notifications when the backend supports them; the timer
        // below drives reconvergence either way
        let mut watch = self.locker.watch(&self.targets_prefix()).await;

        let mut ticker = tokio::time::interval(self.targets_watch_timer);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut backoff = backoff::ExponentialBackoff::from_millis(500)
            .factor(2)
            .max_delay(MAX_LOOP_BACKOFF)
            .jitter();

        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                lost = expirations.next() => {
                    if lost.as_deref() == Some(leader_key.as_str()) {
                        return;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
                _ = recv_watch(&mut watch) => {}
            }

            match self.reconcile().await {
                Ok(()) => backoff.reset(),
                Err(err) => {
                    warn!(message = "assignment iteration failed", %err);

                    tokio::select! {
                        _ = &mut shutdown => return,
                        _ = backoff.wait() => {}
                    }
                }
            }
        }
    }

    /// One assignment pass: every configured target nobody holds goes to
    /// the least-loaded eligible instance.
    async fn reconcile(&self) -> crate::Result<()> {
        let _guard = self.dispatch_lock.lock().await;

        let locks = self.locker.list(&self.targets_prefix()).await?;
        let services = self.locker.get_services(&self.service_name(), &[]).await?;

        // copy-on-read snapshot, immutable within this iteration
        let unassigned: Vec<Arc<TargetConfig>> = {
            let prefix = self.targets_prefix();
            let targets = self.targets.read();
            targets
                .values()
                .filter(|tc| !locks.contains_key(&format!("{}{}", prefix, tc.name)))
                .cloned()
                .collect()
        };

        if unassigned.is_empty() {
            return Ok(());
        }

        let mut owned = owned_by_instance(&locks);

        for tc in unassigned {
            let Some(instance) = self.select_instance(&tc, &services, &owned) else {
                warn!(
                    message = "no eligible instance for target",
                    target = %tc.name,
                );
                continue;
            };

            match self.dispatch(&tc, &instance).await {
                Ok(()) => {
                    *owned.entry(instance_of(&instance).to_string()).or_default() += 1;
                }
                Err(err) => {
                    warn!(
                        message = "dispatch failed",
                        target = %tc.name,
                        instance = %instance.id,
                        %err,
                    );
                }
            }
        }

        Ok(())
    }

    /// Fewest currently-owned targets wins, ties break lexicographically
    /// by instance name. Best-effort: the receiving instance still has to
    /// win the lock itself.
    fn select_instance(
        &self,
        tc: &TargetConfig,
        services: &[ServiceEntry],
        owned: &HashMap<String, usize>,
    ) -> Option<ServiceEntry> {
        let drained = self.drained.lock();

        let affinity = tc
            .tags
            .iter()
            .find_map(|tag| tag.strip_prefix(AFFINITY_TAG));

        // matching target tags are a preference, not a requirement; the
        // explicit affinity tag is binding
        let mut candidates: Vec<(&ServiceEntry, usize, usize)> = services
            .iter()
            .filter(|entry| {
                let name = instance_of(entry);
                !drained.contains(name)
            })
            .filter(|entry| match affinity {
                Some(wanted) => instance_of(entry) == wanted,
                None => true,
            })
            .map(|entry| {
                let matched = tc
                    .tags
                    .iter()
                    .filter(|tag| !tag.starts_with(AFFINITY_TAG))
                    .filter(|tag| entry.tags.contains(tag))
                    .count();
                let count = owned.get(instance_of(entry)).copied().unwrap_or(0);
                (entry, matched, count)
            })
            .filter(|(entry, _, count)| match capacity_of(entry) {
                Some(capacity) => *count < capacity,
                None => true,
            })
            .collect();

        candidates.sort_by(|(a, am, an), (b, bm, bn)| {
            bm.cmp(am)
                .then_with(|| an.cmp(bn))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.first().map(|(entry, _, _)| (*entry).clone())
    }

    /// Hand a target to an instance: upsert its config there, then ask it
    /// to start subscribing.
    async fn dispatch(&self, tc: &TargetConfig, instance: &ServiceEntry) -> crate::Result<()> {
        let endpoint = endpoint_of(instance);

        debug!(
            message = "dispatching target",
            target = %tc.name,
            instance = %instance.id,
        );

        let config = serde_json::to_vec(tc)?;
        self.api_call(
            http::Method::POST,
            &format!("{}/api/v1/config/targets", endpoint),
            config,
        )
        .await?;

        self.api_call(
            http::Method::POST,
            &format!("{}/api/v1/targets/{}", endpoint, tc.name),
            Vec::new(),
        )
        .await
    }

    /// Ask the owning instance to stop a target, releasing its lock.
    async fn unassign(&self, target: &str, instance: &ServiceEntry) -> crate::Result<()> {
        let endpoint = endpoint_of(instance);

        debug!(
            message = "unassigning target",
            target = %target,
            instance = %instance.id,
        );

        self.api_call(
            http::Method::DELETE,
            &format!("{}/api/v1/targets/{}", endpoint, target),
            Vec::new(),
        )
        .await
    }

    async fn api_call(
        &self,
        method: http::Method,
        uri: &str,
        content: Vec<u8>,
    ) -> crate::Result<()> {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(body(content))
            .map_err(|err| err.to_string())?;

        let resp = self.client.send_with_deadline(req, DISPATCH_TIMEOUT).await?;
        if !resp.status().is_success() {
            return Err(format!("{} returned {}", uri, resp.status()).into());
        }

        Ok(())
    }

    /// Move targets off instances owning more than
    /// `ceil(total / live) + slack`; victims are re-dispatched by the
    /// normal assignment loop.
    pub async fn rebalance(&self) -> crate::Result<()> {
        let _guard = self.dispatch_lock.lock().await;

        let locks = self.locker.list(&self.targets_prefix()).await?;
        let services = self.locker.get_services(&self.service_name(), &[]).await?;

        let drained: HashSet<String> = self.drained.lock().iter().cloned().collect();
        let live: Vec<&ServiceEntry> = services
            .iter()
            .filter(|entry| !drained.contains(instance_of(entry)))
            .collect();

        if live.is_empty() {
            return Err("no live instances to rebalance onto".into());
        }

        let total = locks.len();
        let limit = total.div_ceil(live.len()) + self.rebalance_slack;

        let mut by_instance: HashMap<String, Vec<String>> = HashMap::new();
        let prefix = self.targets_prefix();
        for (key, holder) in &locks {
            let target = key.strip_prefix(prefix.as_str()).unwrap_or(key.as_str());
            by_instance
                .entry(holder.clone())
                .or_default()
                .push(target.to_string());
        }

        for entry in &services {
            let name = instance_of(entry).to_string();
            let mut targets = by_instance.remove(&name).unwrap_or_default();
            let over = targets.len().saturating_sub(limit);

            // drained instances shed everything through drain, not here
            if over == 0 || drained.contains(&name) {
                continue;
            }

            // lexicographically smallest victims move
            targets.sort();
            for target in targets.into_iter().take(over) {
                if let Err(err) = self.unassign(&target, entry).await {
                    warn!(message = "rebalance unassign failed", %target, %err);
                }
            }
        }

        Ok(())
    }

    /// Shed every target an instance owns and hand each to someone else;
    /// the instance stays excluded from assignment until re-enabled.
    pub async fn drain(&self, instance: &str) -> crate::Result<()> {
        let services = self.locker.get_services(&self.service_name(), &[]).await?;
        let Some(entry) = services
            .iter()
            .find(|entry| instance_of(entry) == instance)
            .cloned()
        else {
            return Err(format!("unknown instance: {instance}").into());
        };

        self.drained.lock().insert(instance.to_string());

        let _guard = self.dispatch_lock.lock().await;

        let owned_targets = self.instance_targets(instance).await?;
        let locks = self.locker.list(&self.targets_prefix()).await?;
        let mut owned = owned_by_instance(&locks);
        owned.remove(instance);

        for target in owned_targets {
            if let Err(err) = self.unassign(&target, &entry).await {
                warn!(message = "drain unassign failed", %target, %err);
                continue;
            }

            let tc = {
                let targets = self.targets.read();
                targets.get(&target).cloned()
            };
            let Some(tc) = tc else {
                warn!(message = "drained target has no config", %target);
                continue;
            };

            let Some(next) = self.select_instance(&tc, &services, &owned) else {
                warn!(message = "no instance to take drained target", %target);
                continue;
            };

            match self.dispatch(&tc, &next).await {
                Ok(()) => {
                    *owned.entry(instance_of(&next).to_string()).or_default() += 1;
                }
                Err(err) => {
                    warn!(message = "drain dispatch failed", %target, %err);
                }
            }
        }

        Ok(())
    }

    /// Let a drained instance receive work again.
    pub fn undrain(&self, instance: &str) {
        self.drained.lock().remove(instance);
    }

    /// Give up leadership voluntarily; a new election follows.
    pub async fn release_leadership(&self) -> crate::Result<()> {
        self.locker.unlock(&self.leader_key()).await?;
        self.is_leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn leader(&self) -> crate::Result<String> {
        let leader_key = self.leader_key();
        let locks = self.locker.list(&leader_key).await?;
        Ok(locks.get(&leader_key).cloned().unwrap_or_default())
    }

    pub async fn instance_targets(&self, instance: &str) -> crate::Result<Vec<String>> {
        let prefix = self.targets_prefix();
        let locks = self.locker.list(&prefix).await?;

        let mut targets: Vec<String> = locks
            .iter()
            .filter(|(_, holder)| holder.as_str() == instance)
            .map(|(key, _)| {
                key.strip_prefix(prefix.as_str())
                    .unwrap_or(key.as_str())
                    .to_string()
            })
            .collect();

        targets.sort();
        Ok(targets)
    }

    pub async fn members(&self) -> crate::Result<Vec<ClusterMember>> {
        let leader = self.leader().await?;
        let services = self.locker.get_services(&self.service_name(), &[]).await?;
        let locks = self.locker.list(&self.targets_prefix()).await?;

        let prefix = self.targets_prefix();
        let mut by_instance: HashMap<String, Vec<String>> = HashMap::new();
        for (key, holder) in &locks {
            let target = key.strip_prefix(prefix.as_str()).unwrap_or(key.as_str());
            by_instance
                .entry(holder.clone())
                .or_default()
                .push(target.to_string());
        }

        let mut members = Vec::with_capacity(services.len());
        for entry in services {
            let name = instance_of(&entry).to_string();
            let mut locked = by_instance.remove(&name).unwrap_or_default();
            locked.sort();

            members.push(ClusterMember {
                api_endpoint: endpoint_of(&entry),
                is_leader: name == leader,
                number_of_locked_targets: locked.len(),
                locked_targets: locked,
                name,
            });
        }

        Ok(members)
    }

    /// Stop local work and let every lease lapse.
    pub async fn stop(&self) {
        self.manager.stop_all().await;
        if let Err(err) = self.locker.deregister(&self.service_id()).await {
            warn!(message = "service deregistration failed", %err);
        }
        self.locker.stop().await;
    }
}

fn owned_by_instance(locks: &HashMap<String, String>) -> HashMap<String, usize> {
    let mut owned = HashMap::new();
    for holder in locks.values() {
        *owned.entry(holder.clone()).or_default() += 1;
    }
    owned
}

/// `<instance>-api` -> `<instance>`, preferring the explicit tag.
fn instance_of(entry: &ServiceEntry) -> &str {
    entry
        .tag_value("instance-name")
        .unwrap_or_else(|| entry.id.trim_end_matches("-api"))
}

fn endpoint_of(entry: &ServiceEntry) -> String {
    let scheme = entry.tag_value("protocol").unwrap_or("http");
    format!("{}://{}", scheme, entry.address)
}

fn capacity_of(entry: &ServiceEntry) -> Option<usize> {
    entry
        .tags
        .iter()
        .find_map(|tag| tag.strip_prefix(CAPACITY_TAG))
        .and_then(|raw| raw.parse().ok())
}

async fn recv_watch(watch: &mut Option<tokio::sync::mpsc::Receiver<()>>) {
    match watch {
        Some(rx) => {
            if rx.recv().await.is_none() {
                // backend closed the watch, fall back to the timer alone
                *watch = None;
            }
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(instance: &str, tags: &[&str]) -> ServiceEntry {
        let mut all = vec![format!("instance-name={instance}"), "protocol=http".into()];
        all.extend(tags.iter().map(|s| s.to_string()));

        ServiceEntry {
            id: format!("{instance}-api"),
            name: "lab-gnmic-api".into(),
            address: format!("{instance}:7890"),
            tags: all,
        }
    }

    #[test]
    fn helpers() {
        let e = entry("collector-1", &["capacity=2"]);
        assert_eq!(instance_of(&e), "collector-1");
        assert_eq!(endpoint_of(&e), "http://collector-1:7890");
        assert_eq!(capacity_of(&e), Some(2));
    }

    #[test]
    fn owned_counts() {
        let locks = HashMap::from([
            ("gnmic/lab/targets/t1".to_string(), "a".to_string()),
            ("gnmic/lab/targets/t2".to_string(), "a".to_string()),
            ("gnmic/lab/targets/t3".to_string(), "b".to_string()),
        ]);

        let owned = owned_by_instance(&locks);
        assert_eq!(owned["a"], 2);
        assert_eq!(owned["b"], 1);
    }
}
