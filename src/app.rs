//! Process wiring: config in, running collector out.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc;

use crate::api::{self, ApiContext};
use crate::cluster::ClusterCoordinator;
use crate::config::{target_store, Config, SubscriptionConfig, TargetStore};
use crate::coordination::SharedLocker;
use crate::gnmi::Connector;
use crate::loaders::{LoaderContext, TargetOperation};
use crate::outputs::{start_output, Output};
use crate::pipeline::{make_actions, ProcessorContext};
use crate::shutdown::ShutdownCoordinator;
use crate::targets::TargetManager;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A running collector. The gNMI transport is the one external
/// collaborator the caller has to bring.
pub struct App {
    pub config: Arc<Config>,
    pub targets: TargetStore,
    pub manager: Arc<TargetManager>,
    pub cluster: Option<Arc<ClusterCoordinator>>,
    pub outputs: Vec<Arc<Output>>,

    coordinator: ShutdownCoordinator,
    shutdown_request: mpsc::Receiver<()>,
    /// Keeps the request channel open even without an API server.
    shutdown_tx: mpsc::Sender<()>,
}

impl App {
    /// Build and start everything the config names. Returns once the
    /// pieces are running; use [`App::wait`] to block until shutdown is
    /// requested.
    pub async fn start(config: Config, connector: Arc<dyn Connector>) -> crate::Result<App> {
        let config = Arc::new(config);
        let mut coordinator = ShutdownCoordinator::default();

        let instance_name = match config
            .clustering
            .as_ref()
            .and_then(|clustering| clustering.instance_name.clone())
            .or_else(|| config.instance_name.clone())
        {
            Some(name) => name,
            None => crate::hostname()?,
        };

        // actions and processors compile before anything network-facing
        // starts; failures here are fatal
        let actions = make_actions(&config.actions)?;
        let processor_cx = ProcessorContext { actions };

        let mut outputs = Vec::with_capacity(config.outputs.len());
        for (name, outer) in &config.outputs {
            let output = start_output(
                name,
                outer,
                &config.processors,
                &processor_cx,
                coordinator.register(format!("output:{name}")),
            )
            .await?;
            outputs.push(output);
        }

        let locker: Option<SharedLocker> = match &config.clustering {
            Some(clustering) => Some(clustering.locker.build().await?),
            None => None,
        };

        let targets = target_store(&config.targets);

        let subscriptions: IndexMap<String, SubscriptionConfig> = config
            .subscriptions
            .iter()
            .map(|(name, sc)| {
                let mut sc = sc.clone();
                sc.name = name.clone();
                (name.clone(), sc)
            })
            .collect();

        let manager = TargetManager::new(
            instance_name.clone(),
            config
                .clustering
                .as_ref()
                .map(|clustering| clustering.cluster_name.clone()),
            locker.clone(),
            connector,
            outputs.clone(),
            subscriptions,
            // begin-only: stop() awaits the target tasks itself
            coordinator.watcher("targets"),
        );

        let cluster = match (&config.clustering, locker.clone()) {
            (Some(clustering), Some(locker)) => {
                let api_server = config.api_server.as_ref().ok_or(
                    "clustering requires an api-server section so peers can dispatch targets",
                )?;

                let cluster = ClusterCoordinator::new(
                    clustering,
                    instance_name.clone(),
                    api_server.address.to_string(),
                    api_server.tls.is_some(),
                    locker,
                    Arc::clone(&manager),
                    Arc::clone(&targets),
                    coordinator.watcher("cluster"),
                )?;
                cluster.start().await?;

                Some(cluster)
            }
            _ => None,
        };

        let (shutdown_tx, shutdown_request) = mpsc::channel(1);

        if let Some(api_server) = &config.api_server {
            let shutdown_tx = shutdown_tx.clone();
            let context = Arc::new(ApiContext {
                config: Arc::clone(&config),
                targets: Arc::clone(&targets),
                manager: Arc::clone(&manager),
                cluster: cluster.clone(),
                enable_metrics: api_server.enable_metrics,
                shutdown_request: shutdown_tx,
            });

            let server_config = api_server.clone();
            let signal = coordinator.register("api");
            tokio::spawn(async move {
                if let Err(err) = api::serve(&server_config, context, signal).await {
                    error!(message = "api server failed", %err);
                }
            });
        }

        // the configured target map is the initial snapshot; a loader, if
        // any, layers its own operations on top of it
        let initial = TargetOperation {
            add: targets
                .read()
                .iter()
                .map(|(name, tc)| (name.clone(), (**tc).clone()))
                .collect(),
            del: Vec::new(),
        };

        let (ops_tx, ops_rx) = mpsc::channel(16);
        if !initial.is_empty() {
            let _ = ops_tx.send(initial).await;
        }

        if let Some(loader_config) = &config.loader {
            let loader = loader_config
                .build(LoaderContext {
                    out: ops_tx.clone(),
                    shutdown: coordinator.register("loader"),
                    locker: locker.clone(),
                })
                .await?;
            tokio::spawn(loader);
        }

        tokio::spawn(apply_operations(
            ops_rx,
            Arc::clone(&targets),
            Arc::clone(&manager),
            cluster.is_some(),
        ));

        info!(
            message = "collector started",
            instance = %instance_name,
            clustered = cluster.is_some(),
        );

        Ok(App {
            config,
            targets,
            manager,
            cluster,
            outputs,
            coordinator,
            shutdown_request,
            shutdown_tx,
        })
    }

    /// Ask the app to wind down, same as the admin shutdown endpoint.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.try_send(());
    }

    /// Block until an admin shutdown request or SIGINT.
    pub async fn wait(&mut self) {
        tokio::select! {
            _ = self.shutdown_request.recv() => {
                info!(message = "shutdown requested via admin api");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(message = "waiting for interrupt failed", %err);
                }
                info!(message = "interrupt received");
            }
        }
    }

    /// Graceful teardown: shed targets (releasing their locks), leave the
    /// cluster, then wait for every task up to the grace period.
    pub async fn stop(self) {
        match &self.cluster {
            Some(cluster) => cluster.stop().await,
            None => self.manager.stop_all().await,
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        self.coordinator.shutdown_all(deadline).await;
    }
}

/// Serialized loader operations against the shared target map. Deletes
/// stop local subscriptions everywhere; adds start locally only when not
/// clustered, since the leader dispatches otherwise.
async fn apply_operations(
    mut ops: mpsc::Receiver<TargetOperation>,
    targets: TargetStore,
    manager: Arc<TargetManager>,
    clustered: bool,
) {
    while let Some(op) = ops.recv().await {
        debug!(
            message = "applying target operation",
            adds = op.add.len(),
            dels = op.del.len(),
        );

        for name in &op.del {
            targets.write().shift_remove(name);
            manager.stop_target(name);
        }

        for (name, tc) in op.add {
            let tc = Arc::new(tc);
            targets.write().insert(name, Arc::clone(&tc));

            if !clustered {
                if manager.is_running(&tc.name) {
                    manager.restart_target(tc);
                } else {
                    manager.start_target(tc);
                }
            }
        }
    }
}

