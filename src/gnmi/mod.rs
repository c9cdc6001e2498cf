//! The gNMI surface this collector consumes.
//!
//! The wire protocol itself lives behind [`Connector`]/[`Channel`]; this
//! module only models the request/response shapes the rest of the crate
//! needs to build subscriptions and convert notifications into events.

pub mod xpath;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::{SubscriptionConfig, TargetConfig};

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct PathElem {
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub key: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct Path {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elem: Vec<PathElem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl Path {
    /// Render the path in xpath form, list keys included, e.g.
    /// `/interfaces/interface[name=ethernet1/1]/state/counters`.
    pub fn to_xpath(&self) -> String {
        let mut out = String::new();

        for elem in &self.elem {
            out.push('/');
            out.push_str(&elem.name);
            for (key, value) in &elem.key {
                out.push('[');
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push(']');
            }
        }

        out
    }

    /// Concatenate a prefix and a path the way a gNMI notification does.
    pub fn joined(prefix: Option<&Path>, path: &Path) -> Path {
        let mut elem = Vec::new();
        if let Some(prefix) = prefix {
            elem.extend(prefix.elem.iter().cloned());
        }
        elem.extend(path.elem.iter().cloned());

        Path {
            origin: path
                .origin
                .clone()
                .or_else(|| prefix.and_then(|p| p.origin.clone())),
            target: path
                .target
                .clone()
                .or_else(|| prefix.and_then(|p| p.target.clone())),
            elem,
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xpath())
    }
}

/// A decoded leaf value.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TypedValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Json(serde_json::Value),
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Update {
    pub path: Path,
    pub value: TypedValue,
}

/// One timestamped batch of updates from a target, prefix already split out.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Notification {
    /// Nanoseconds since the unix epoch, as reported by the target.
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<Path>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Update>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<Path>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubscribeResponse {
    Update(Notification),
    SyncResponse(bool),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionListMode {
    #[default]
    Stream,
    Once,
    Poll,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    #[default]
    TargetDefined,
    OnChange,
    Sample,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    Json,
    Bytes,
    Proto,
    Ascii,
    #[default]
    JsonIetf,
}

/// Replay window for targets that buffer history.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum History {
    /// State as of a single point in time, nanoseconds since the epoch.
    Snapshot(i64),
    /// Everything between the two instants.
    Range { start: i64, end: i64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub path: Path,
    pub mode: StreamMode,
    pub sample_interval: Option<Duration>,
}

/// The request a per-target task sends once its channel is up.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribeRequest {
    /// Subscription name, used as the event name downstream.
    pub name: String,
    pub prefix: Option<Path>,
    pub mode: SubscriptionListMode,
    pub encoding: Encoding,
    pub subscriptions: Vec<Subscription>,
    pub history: Option<History>,
}

impl SubscribeRequest {
    /// Build the request for one named subscription of a target. Fails on an
    /// unparsable path, which is a configuration error.
    pub fn build(sc: &SubscriptionConfig) -> crate::Result<Self> {
        let mut subscriptions = Vec::with_capacity(sc.paths.len());
        for path in &sc.paths {
            let parsed = xpath::parse(path)
                .map_err(|rest| format!("invalid subscription path {path:?} at {rest:?}"))?;

            subscriptions.push(Subscription {
                path: parsed,
                mode: sc.stream_mode,
                sample_interval: sc.sample_interval,
            });
        }

        Ok(SubscribeRequest {
            name: sc.name.clone(),
            prefix: None,
            mode: sc.mode,
            encoding: sc.encoding.unwrap_or_default(),
            subscriptions,
            history: sc.history.clone(),
        })
    }
}

pub type SubscribeStream = BoxStream<'static, crate::Result<SubscribeResponse>>;

/// An established gNMI channel to one target.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Send the subscribe request and return the response stream. The stream
    /// ends when the target closes it or the channel is dropped.
    async fn subscribe(&self, request: SubscribeRequest) -> crate::Result<SubscribeStream>;
}

/// Dials targets. The concrete transport (gRPC, tunnels) is provided by an
/// external client implementation; tests use an in-process fake.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &TargetConfig) -> crate::Result<Box<dyn Channel>>;
}
