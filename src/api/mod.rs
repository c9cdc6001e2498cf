//! The admin HTTP API: read-only config and cluster introspection plus
//! the handful of mutating operations the leader and operators need.
//!
//! Everything answers JSON; failures carry `{"errors": [...]}` with 400
//! for malformed bodies and non-leader invocations of leader-only
//! operations, 404 for unknown ids and 500 for internal trouble.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Buf;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::cluster::{ClusterCoordinator, ClusterMember};
use crate::config::{ApiServerConfig, Config, TargetConfig, TargetStore};
use crate::http::{body, read_body, Body};
use crate::shutdown::ShutdownSignal;
use crate::targets::TargetManager;

/// Everything a handler can reach.
pub struct ApiContext {
    pub config: Arc<Config>,
    pub targets: TargetStore,
    pub manager: Arc<TargetManager>,
    pub cluster: Option<Arc<ClusterCoordinator>>,
    pub enable_metrics: bool,
    /// Fired by `POST /api/v1/admin/shutdown`.
    pub shutdown_request: tokio::sync::mpsc::Sender<()>,
}

#[derive(Serialize)]
struct ApiErrors {
    errors: Vec<String>,
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let content = serde_json::to_vec(value).unwrap_or_else(|err| {
        format!("{{\"errors\":[\"encode response: {err}\"]}}").into_bytes()
    });

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(body(content))
        .expect("static response builds")
}

fn errors(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json_response(
        status,
        &ApiErrors {
            errors: vec![message.into()],
        },
    )
}

fn not_found(what: &str, id: &str) -> Response<Body> {
    errors(StatusCode::NOT_FOUND, format!("{what} {id:?} not found"))
}

fn ok_empty() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(body(Vec::new()))
        .expect("static response builds")
}

/// Bind and serve until shutdown. TLS when the config carries certs.
pub async fn serve(
    config: &ApiServerConfig,
    context: Arc<ApiContext>,
    mut shutdown: ShutdownSignal,
) -> crate::Result<()> {
    let listener = TcpListener::bind(config.address)
        .await
        .map_err(|err| format!("bind {}: {err}", config.address))?;

    let acceptor = match &config.tls {
        Some(tls) => Some(TlsAcceptor::from(Arc::new(tls.server_config()?))),
        None => None,
    };

    info!(message = "api server listening", address = %config.address);

    loop {
        let (stream, peer) = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(message = "accept new connection failed", %err);
                    continue;
                }
            }
        };

        let context = Arc::clone(&context);
        let acceptor = acceptor.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let context = Arc::clone(&context);
                async move { Ok::<_, std::convert::Infallible>(handle(req, context).await) }
            });

            let builder = Builder::new(TokioExecutor::new());
            let served = match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        builder
                            .serve_connection(TokioIo::new(tls_stream), service)
                            .await
                    }
                    Err(err) => {
                        debug!(message = "TLS handshake failed", %peer, %err);
                        return;
                    }
                },
                None => {
                    builder
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                }
            };

            if let Err(err) = served {
                trace!(message = "failed to serve http connection", %peer, %err);
            }
        });
    }
}

async fn handle(req: Request<Incoming>, cx: Arc<ApiContext>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().trim_matches('/').to_string();
    let segments: Vec<&str> = path.split('/').collect();

    if method != Method::GET && path != "api/v1/healthz" {
        debug!(message = "admin request", %method, %path);
    }

    let content = match read_body(req.into_body()).await {
        Ok(content) => content,
        Err(err) => return errors(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match (method, segments.as_slice()) {
        (Method::GET, ["metrics"]) => metrics_text(&cx),

        (Method::GET, ["api", "v1", "healthz"]) => {
            json_response(StatusCode::OK, &json!({"status": "healthy"}))
        }

        (Method::POST, ["api", "v1", "admin", "shutdown"]) => {
            info!(message = "shutting down due to user request");
            let _ = cx.shutdown_request.try_send(());
            ok_empty()
        }

        (Method::GET, ["api", "v1", "config"]) => whole_config(&cx),
        (Method::GET, ["api", "v1", "config", "targets"]) => config_targets(&cx, None),
        (Method::GET, ["api", "v1", "config", "targets", id]) => config_targets(&cx, Some(id)),
        (Method::POST, ["api", "v1", "config", "targets"]) => {
            upsert_target(&cx, content.chunk())
        }
        (Method::DELETE, ["api", "v1", "config", "targets", id]) => delete_target(&cx, id),
        (Method::POST, ["api", "v1", "config", "targets", id, "subscriptions"]) => {
            update_subscriptions(&cx, id, content.chunk())
        }

        (Method::GET, ["api", "v1", "config", "subscriptions"]) => {
            json_response(StatusCode::OK, &cx.config.subscriptions)
        }
        (Method::GET, ["api", "v1", "config", "outputs"]) => {
            json_response(StatusCode::OK, &cx.config.outputs)
        }
        (Method::GET, ["api", "v1", "config", "inputs"]) => {
            json_response(StatusCode::OK, &cx.config.inputs)
        }
        (Method::GET, ["api", "v1", "config", "processors"]) => {
            json_response(StatusCode::OK, &cx.config.processors)
        }
        (Method::GET, ["api", "v1", "config", "clustering"]) => {
            json_response(StatusCode::OK, &cx.config.clustering)
        }
        (Method::GET, ["api", "v1", "config", "api-server"]) => {
            json_response(StatusCode::OK, &cx.config.api_server)
        }
        (Method::GET, ["api", "v1", "config", "gnmi-server"]) => {
            json_response(StatusCode::OK, &cx.config.gnmi_server)
        }

        (Method::GET, ["api", "v1", "targets"]) => runtime_targets(&cx, None),
        (Method::GET, ["api", "v1", "targets", id]) => runtime_targets(&cx, Some(id)),
        (Method::POST, ["api", "v1", "targets", id]) => start_target(&cx, id),
        (Method::DELETE, ["api", "v1", "targets", id]) => stop_target(&cx, id),

        (Method::GET, ["api", "v1", "cluster"]) => cluster_view(&cx).await,
        (Method::GET, ["api", "v1", "cluster", "members"]) => cluster_members(&cx).await,
        (Method::GET, ["api", "v1", "cluster", "leader"]) => cluster_leader(&cx).await,
        (Method::DELETE, ["api", "v1", "cluster", "leader"]) => release_leader(&cx).await,
        (Method::POST, ["api", "v1", "cluster", "rebalance"]) => rebalance(&cx),
        (Method::POST, ["api", "v1", "cluster", "drain", id]) => drain(&cx, id).await,
        (Method::DELETE, ["api", "v1", "cluster", "drain", id]) => undrain(&cx, id),

        _ => errors(StatusCode::NOT_FOUND, "no such endpoint"),
    }
}

fn metrics_text(cx: &ApiContext) -> Response<Body> {
    if !cx.enable_metrics {
        return errors(StatusCode::NOT_FOUND, "metrics are not enabled");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body(
            metrics::encode_text(metrics::global_registry()).into_bytes(),
        ))
        .expect("static response builds")
}

/// The whole config with the live target map substituted in, passwords
/// redacted.
fn whole_config(cx: &ApiContext) -> Response<Body> {
    let mut value = match serde_json::to_value(&*cx.config) {
        Ok(value) => value,
        Err(err) => return errors(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let targets: IndexMap<String, TargetConfig> = cx
        .targets
        .read()
        .iter()
        .map(|(name, tc)| (name.clone(), tc.redacted()))
        .collect();

    match serde_json::to_value(&targets) {
        Ok(targets) => {
            value["targets"] = targets;
        }
        Err(err) => return errors(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }

    json_response(StatusCode::OK, &value)
}

fn config_targets(cx: &ApiContext, id: Option<&str>) -> Response<Body> {
    let targets = cx.targets.read();

    match id {
        None => {
            let redacted: IndexMap<String, TargetConfig> = targets
                .iter()
                .map(|(name, tc)| (name.clone(), tc.redacted()))
                .collect();
            json_response(StatusCode::OK, &redacted)
        }
        Some(id) => match targets.get(id) {
            Some(tc) => json_response(StatusCode::OK, &tc.redacted()),
            None => not_found("target", id),
        },
    }
}

fn upsert_target(cx: &ApiContext, content: &[u8]) -> Response<Body> {
    let mut tc: TargetConfig = match serde_json::from_slice(content) {
        Ok(tc) => tc,
        Err(err) => return errors(StatusCode::BAD_REQUEST, err.to_string()),
    };

    if tc.name.is_empty() {
        return errors(StatusCode::BAD_REQUEST, "target name is required");
    }
    if tc.address.is_empty() {
        tc.address = tc.name.clone();
    }

    for sub in &tc.subscriptions {
        if !cx.config.subscriptions.contains_key(sub) {
            return errors(
                StatusCode::BAD_REQUEST,
                format!("unknown subscription {sub:?}"),
            );
        }
    }

    cx.targets
        .write()
        .insert(tc.name.clone(), Arc::new(tc));

    ok_empty()
}

fn delete_target(cx: &ApiContext, id: &str) -> Response<Body> {
    let removed = cx.targets.write().shift_remove(id);
    if removed.is_none() {
        return not_found("target", id);
    }

    cx.manager.stop_target(id);
    ok_empty()
}

fn update_subscriptions(cx: &ApiContext, id: &str, content: &[u8]) -> Response<Body> {
    let existing = match cx.targets.read().get(id) {
        Some(tc) => Arc::clone(tc),
        None => return not_found("target", id),
    };

    let request: HashMap<String, Vec<String>> = match serde_json::from_slice(content) {
        Ok(request) => request,
        Err(err) => return errors(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let Some(subscriptions) = request.get("subscriptions") else {
        return errors(StatusCode::BAD_REQUEST, "subscriptions not found");
    };

    for sub in subscriptions {
        if !cx.config.subscriptions.contains_key(sub) {
            return errors(
                StatusCode::BAD_REQUEST,
                format!("unknown subscription {sub:?}"),
            );
        }
    }

    let mut tc = (*existing).clone();
    tc.subscriptions = subscriptions.clone();
    let tc = Arc::new(tc);

    cx.targets.write().insert(id.to_string(), Arc::clone(&tc));

    // the subscription set changed; close and reopen, never patch in place
    if cx.manager.is_running(id) {
        cx.manager.restart_target(tc);
    }

    ok_empty()
}

fn runtime_targets(cx: &ApiContext, id: Option<&str>) -> Response<Body> {
    let running: IndexMap<String, String> = cx
        .manager
        .running()
        .into_iter()
        .map(|(name, state)| {
            (
                name,
                serde_json::to_value(state)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
            )
        })
        .collect();

    match id {
        None => json_response(StatusCode::OK, &running),
        Some(id) => match running.get(id) {
            Some(state) => json_response(StatusCode::OK, &json!({ id: state })),
            None => errors(StatusCode::NOT_FOUND, "no targets found"),
        },
    }
}

fn start_target(cx: &ApiContext, id: &str) -> Response<Body> {
    let tc = match cx.targets.read().get(id) {
        Some(tc) => Arc::clone(tc),
        None => return not_found("target", id),
    };

    cx.manager.start_target(tc);
    ok_empty()
}

fn stop_target(cx: &ApiContext, id: &str) -> Response<Body> {
    if !cx.manager.is_running(id) {
        return not_found("target", id);
    }

    cx.manager.stop_target(id);
    ok_empty()
}

#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusteringResponse {
    name: String,
    number_of_locked_targets: usize,
    leader: String,
    members: Vec<ClusterMember>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

fn no_clustering() -> Response<Body> {
    errors(StatusCode::BAD_REQUEST, "clustering is not enabled")
}

/// Aggregate view; partial data with the failures in a sidecar field.
async fn cluster_view(cx: &ApiContext) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    let mut response = ClusteringResponse {
        name: cluster.cluster_name().to_string(),
        number_of_locked_targets: 0,
        leader: String::new(),
        members: Vec::new(),
        errors: Vec::new(),
    };

    match cluster.leader().await {
        Ok(leader) => response.leader = leader,
        Err(err) => response.errors.push(err.to_string()),
    }

    match cluster.members().await {
        Ok(members) => {
            response.number_of_locked_targets = members
                .iter()
                .map(|member| member.number_of_locked_targets)
                .sum();
            response.members = members;
        }
        Err(err) => response.errors.push(err.to_string()),
    }

    json_response(StatusCode::OK, &response)
}

async fn cluster_members(cx: &ApiContext) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    match cluster.members().await {
        Ok(members) => json_response(StatusCode::OK, &members),
        Err(err) => errors(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn cluster_leader(cx: &ApiContext) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    match cluster.members().await {
        Ok(members) => {
            let leader: Vec<ClusterMember> =
                members.into_iter().filter(|member| member.is_leader).collect();
            json_response(StatusCode::OK, &leader)
        }
        Err(err) => errors(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn release_leader(cx: &ApiContext) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    if !cluster.is_leader() {
        return errors(StatusCode::BAD_REQUEST, "not leader");
    }

    match cluster.release_leadership().await {
        Ok(()) => ok_empty(),
        Err(err) => errors(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn rebalance(cx: &ApiContext) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    if !cluster.is_leader() {
        return errors(StatusCode::BAD_REQUEST, "not leader");
    }

    let cluster = Arc::clone(cluster);
    tokio::spawn(async move {
        if let Err(err) = cluster.rebalance().await {
            warn!(message = "rebalance failed", %err);
        }
    });

    ok_empty()
}

async fn drain(cx: &ApiContext, id: &str) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    if !cluster.is_leader() {
        return errors(StatusCode::BAD_REQUEST, "not leader");
    }
    if id.is_empty() {
        return errors(StatusCode::BAD_REQUEST, "instance id is required");
    }

    let cluster = Arc::clone(cluster);
    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(err) = cluster.drain(&id).await {
            warn!(message = "drain failed", instance = %id, %err);
        }
    });

    ok_empty()
}

fn undrain(cx: &ApiContext, id: &str) -> Response<Body> {
    let Some(cluster) = &cx.cluster else {
        return no_clustering();
    };

    if !cluster.is_leader() {
        return errors(StatusCode::BAD_REQUEST, "not leader");
    }

    cluster.undrain(id);
    ok_empty()
}
