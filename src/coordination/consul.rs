//! Consul-backed coordination: lease-TTL sessions for locks, the KV store
//! for holder visibility, and the agent service registry for membership.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Buf;
use http::{Request, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{
    CoordinationError, Locker, LockerConfig, ServiceEntry, ServiceRegistration, SharedLocker,
};
use crate::http::{body, read_body, HttpClient, HttpError};
use crate::tls::TlsConfig;

const OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum ConsulError {
    #[snafu(display("Build request failed: {source}"))]
    BuildRequest { source: http::Error },
    #[snafu(display("Do http request failed: {source}"))]
    HttpErr { source: HttpError },
    #[snafu(display("Decode response failed: {source}"))]
    Decode { source: serde_json::Error },
    #[snafu(display("Unexpected status {code}: {body}"))]
    UnexpectedStatusCode { code: u16, body: String },
}

impl From<ConsulError> for CoordinationError {
    fn from(err: ConsulError) -> Self {
        match &err {
            ConsulError::UnexpectedStatusCode { code: 403, .. } => {
                CoordinationError::PermissionDenied(err.to_string())
            }
            ConsulError::UnexpectedStatusCode { code: 404, .. } => {
                CoordinationError::NotFound(err.to_string())
            }
            _ => CoordinationError::Transient(err.to_string()),
        }
    }
}

// Not all fields included, only the ones we need
#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthService {
    #[serde(rename = "Node")]
    node: HealthNode,
    #[serde(rename = "Service")]
    service: HealthServiceEntry,
}

#[derive(Debug, Deserialize)]
struct HealthNode {
    #[serde(rename = "Address")]
    address: String,
}

#[derive(Debug, Deserialize)]
struct HealthServiceEntry {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AgentCheck {
    #[serde(rename = "HTTP")]
    http: String,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

#[derive(Debug, Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck>,
}

struct HeldLock {
    session: String,
    renew: JoinHandle<()>,
}

/// One process's client. Every held lock gets its own session, renewed at
/// half the TTL; a failed renewal surfaces the key on the expiration
/// channel and the lease lapses server-side.
pub struct ConsulLocker {
    client: HttpClient,
    endpoint: String,
    session_ttl: Duration,
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
    expired_tx: broadcast::Sender<String>,
}

impl ConsulLocker {
    pub fn new(endpoint: String, session_ttl: Duration, client: HttpClient) -> Arc<Self> {
        let (expired_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            client,
            endpoint,
            session_ttl,
            held: Arc::new(Mutex::new(HashMap::new())),
            expired_tx,
        })
    }

    async fn call(
        &self,
        method: http::Method,
        path: &str,
        content: Option<Vec<u8>>,
    ) -> Result<bytes::Bytes, ConsulError> {
        let uri = format!("{}{}", self.endpoint, path);
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(body(content.unwrap_or_default()))
            .context(BuildRequestSnafu)?;

        let resp = self
            .client
            .send_with_deadline(req, OP_TIMEOUT)
            .await
            .context(HttpErrSnafu)?;

        let (parts, incoming) = resp.into_parts();
        let content = read_body(incoming).await.context(HttpErrSnafu)?;

        match parts.status {
            StatusCode::OK => Ok(content),
            status => Err(ConsulError::UnexpectedStatusCode {
                code: status.as_u16(),
                body: String::from_utf8_lossy(content.chunk()).into_owned(),
            }),
        }
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ConsulError> {
        let content = self.call(http::Method::GET, path, None).await?;
        serde_json::from_slice(content.chunk()).context(DecodeSnafu)
    }

    async fn create_session(&self) -> Result<String, ConsulError> {
        let payload = serde_json::json!({
            "TTL": format!("{}s", self.session_ttl.as_secs().max(10)),
            "Behavior": "delete",
            "LockDelay": "0s",
        });

        let content = self
            .call(
                http::Method::PUT,
                "/v1/session/create",
                Some(payload.to_string().into_bytes()),
            )
            .await?;

        let created: SessionCreated =
            serde_json::from_slice(content.chunk()).context(DecodeSnafu)?;
        Ok(created.id)
    }

    fn spawn_renew(&self, key: String, session: String) -> JoinHandle<()> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let period = self.session_ttl / 2;
        let held = Arc::clone(&self.held);
        let expired_tx = self.expired_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;

                let uri = format!("{}/v1/session/renew/{}", endpoint, session);
                let req = match Request::builder()
                    .method(http::Method::PUT)
                    .uri(uri)
                    .body(body(Vec::new()))
                {
                    Ok(req) => req,
                    Err(_err) => break,
                };

                match client.send_with_deadline(req, OP_TIMEOUT).await {
                    Ok(resp) if resp.status() == StatusCode::OK => continue,
                    Ok(resp) => {
                        warn!(
                            message = "session renewal rejected, lease lost",
                            %key,
                            status = %resp.status(),
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(
                            message = "session renewal failed, lease lost",
                            %key,
                            %err,
                        );
                        break;
                    }
                }
            }

            held.lock().remove(&key);
            let _ = expired_tx.send(key);
        })
    }
}

#[async_trait]
impl Locker for ConsulLocker {
    async fn lock(&self, key: &str, value: &str) -> Result<bool, CoordinationError> {
        if self.held.lock().contains_key(key) {
            return Ok(true);
        }

        let session = self.create_session().await?;

        let path = format!("/v1/kv/{}?acquire={}", key, session);
        let content = self
            .call(
                http::Method::PUT,
                &path,
                Some(value.as_bytes().to_vec()),
            )
            .await?;

        let acquired = String::from_utf8_lossy(content.chunk()).trim() == "true";
        if !acquired {
            // lost the race; don't leave the session behind
            let path = format!("/v1/session/destroy/{}", session);
            let _ = self.call(http::Method::PUT, &path, None).await;
            return Ok(false);
        }

        let renew = self.spawn_renew(key.to_string(), session.clone());
        self.held
            .lock()
            .insert(key.to_string(), HeldLock { session, renew });

        Ok(true)
    }

    async fn unlock(&self, key: &str) -> Result<(), CoordinationError> {
        let Some(held) = self.held.lock().remove(key) else {
            return Ok(());
        };

        held.renew.abort();

        let path = format!("/v1/kv/{}?release={}", key, held.session);
        self.call(http::Method::PUT, &path, None).await?;
        let path = format!("/v1/session/destroy/{}", held.session);
        let _ = self.call(http::Method::PUT, &path, None).await;
        let path = format!("/v1/kv/{}", key);
        let _ = self.call(http::Method::DELETE, &path, None).await;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<HashMap<String, String>, CoordinationError> {
        let path = format!("/v1/kv/{}?recurse=true", prefix);
        let pairs: Vec<KvPair> = match self.fetch(&path).await {
            Ok(pairs) => pairs,
            Err(ConsulError::UnexpectedStatusCode { code: 404, .. }) => Vec::new(),
            Err(err) => return Err(err.into()),
        };

        let engine = base64::engine::general_purpose::STANDARD;
        Ok(pairs
            .into_iter()
            .filter_map(|pair| {
                let raw = pair.value?;
                let decoded = engine.decode(raw).ok()?;
                Some((pair.key, String::from_utf8_lossy(&decoded).into_owned()))
            })
            .collect())
    }

    async fn get_services(
        &self,
        name: &str,
        tag_filters: &[String],
    ) -> Result<Vec<ServiceEntry>, CoordinationError> {
        let path = format!("/v1/health/service/{}?passing=true", name);
        let services: Vec<HealthService> = self.fetch(&path).await.map_err(CoordinationError::from)?;

        let mut entries = services
            .into_iter()
            .filter(|hs| {
                tag_filters
                    .iter()
                    .all(|filter| hs.service.tags.contains(filter))
            })
            .map(|hs| {
                let host = if hs.service.address.is_empty() {
                    hs.node.address
                } else {
                    hs.service.address
                };

                ServiceEntry {
                    id: hs.service.id,
                    name: hs.service.service,
                    address: format!("{}:{}", host, hs.service.port),
                    tags: hs.service.tags,
                }
            })
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn register(&self, service: ServiceRegistration) -> Result<(), CoordinationError> {
        let (host, port) = match service.address.rsplit_once(':') {
            Some((host, port)) => (
                host.to_string(),
                port.parse::<u16>()
                    .map_err(|err| CoordinationError::Transient(err.to_string()))?,
            ),
            None => (service.address.clone(), 0),
        };

        let registration = AgentServiceRegistration {
            id: service.id,
            name: service.name,
            address: host,
            port,
            tags: service.tags,
            check: (!service.check_url.is_empty()).then(|| AgentCheck {
                http: service.check_url,
                interval: "5s".to_string(),
                deregister_after: "30s".to_string(),
            }),
        };

        let payload = serde_json::to_vec(&registration)
            .map_err(|err| CoordinationError::Transient(err.to_string()))?;
        self.call(
            http::Method::PUT,
            "/v1/agent/service/register",
            Some(payload),
        )
        .await
        .map_err(CoordinationError::from)?;

        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), CoordinationError> {
        let path = format!("/v1/agent/service/deregister/{}", id);
        self.call(http::Method::PUT, &path, None)
            .await
            .map_err(CoordinationError::from)?;
        Ok(())
    }

    fn expirations(&self) -> broadcast::Receiver<String> {
        self.expired_tx.subscribe()
    }

    async fn stop(&self) {
        let held: Vec<String> = self.held.lock().keys().cloned().collect();
        for key in held {
            if let Err(err) = self.unlock(&key).await {
                warn!(message = "release lock on stop failed", %key, %err);
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ConsulLockerConfig {
    /// `http(s)://host:port` of the local agent.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub session_ttl: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

fn default_address() -> String {
    "http://localhost:8500".to_string()
}

const fn default_session_ttl() -> Duration {
    Duration::from_secs(10)
}

#[async_trait]
#[typetag::serde(name = "consul")]
impl LockerConfig for ConsulLockerConfig {
    async fn build(&self) -> crate::Result<SharedLocker> {
        let client = HttpClient::new(self.tls.as_ref())?;
        let locker = ConsulLocker::new(
            self.address.trim_end_matches('/').to_string(),
            self.session_ttl,
            client,
        );

        Ok(locker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: ConsulLockerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.address, "http://localhost:8500");
        assert_eq!(config.session_ttl, Duration::from_secs(10));
    }

    #[test]
    fn error_mapping() {
        let err = ConsulError::UnexpectedStatusCode {
            code: 403,
            body: "rule missing".into(),
        };
        assert!(matches!(
            CoordinationError::from(err),
            CoordinationError::PermissionDenied(_)
        ));

        let err = ConsulError::UnexpectedStatusCode {
            code: 500,
            body: "".into(),
        };
        assert!(CoordinationError::from(err).is_transient());
    }
}
