mod env;
mod format;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use env::apply_env_overrides;
pub use format::Format;

use crate::gnmi::{Encoding, History, StreamMode, SubscriptionListMode};
use crate::loaders::LoaderConfig;
use crate::outputs::OutputConfig;
use crate::pipeline::ProcessorConfig;
use crate::tls::TlsConfig;

pub const ENV_PREFIX: &str = "GNMIC_";

/// How one network element is reached and what it is subscribed to.
///
/// A dispatched target is immutable; updates arrive as delete-then-add.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TargetConfig {
    #[serde(default)]
    pub name: String,

    /// `host:port` of the gNMI server.
    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Plaintext instead of TLS.
    #[serde(default)]
    pub insecure: bool,

    /// Names of subscriptions to open; empty means all configured ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<String>,

    /// Free-form labels. Order is part of the identity, a reorder counts
    /// as a config change.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,

    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Per-target event buffer between the subscribe loop and the outputs.
    #[serde(default = "default_target_buffer")]
    pub buffer_size: usize,
}

impl TargetConfig {
    /// Copy with the password replaced by `****`, for every API read.
    pub fn redacted(&self) -> Self {
        let mut tc = self.clone();
        if tc.password.is_some() {
            tc.password = Some("****".to_string());
        }
        tc
    }
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_target_buffer() -> usize {
    100
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SubscriptionConfig {
    #[serde(default)]
    pub name: String,

    /// Ordered xpaths to subscribe.
    pub paths: Vec<String>,

    #[serde(default)]
    pub mode: SubscriptionListMode,

    #[serde(default)]
    pub stream_mode: StreamMode,

    #[serde(default, with = "humantime_serde::option")]
    pub sample_interval: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,

    /// Replay window for targets that buffer history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<History>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ClusteringConfig {
    pub cluster_name: String,

    /// Defaults to the hostname.
    #[serde(default)]
    pub instance_name: Option<String>,

    /// How often the leader reconciles assignment.
    #[serde(default = "default_targets_watch", with = "humantime_serde")]
    pub targets_watch_timer: Duration,

    /// Pause between leader-election attempts.
    #[serde(default = "default_leader_wait", with = "humantime_serde")]
    pub leader_wait_timer: Duration,

    /// Allowed imbalance above `ceil(total / instances)` before rebalance
    /// moves targets.
    #[serde(default)]
    pub rebalance_slack: usize,

    /// Tags an instance must carry to receive dispatches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    pub locker: Box<dyn crate::coordination::LockerConfig>,
}

const fn default_targets_watch() -> Duration {
    Duration::from_secs(20)
}

const fn default_leader_wait() -> Duration {
    Duration::from_secs(5)
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct ApiServerConfig {
    pub address: SocketAddr,

    #[serde(default = "default_api_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

const fn default_api_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Options shared by every output regardless of its kind.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputOuter {
    #[serde(flatten)]
    pub inner: Box<dyn OutputConfig>,

    /// Names of processors to run, in order, before events reach this output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_processors: Vec<String>,

    /// Bound of the event channel between producers and workers.
    #[serde(default = "default_output_buffer")]
    pub buffer_size: usize,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_flush_timer", with = "humantime_serde")]
    pub flush_timer: Duration,

    /// Zero disables the health loop; sinks without one never reset.
    #[serde(default, with = "humantime_serde")]
    pub health_check_period: Duration,
}

const fn default_output_buffer() -> usize {
    1000
}

const fn default_workers() -> usize {
    1
}

const fn default_batch_size() -> usize {
    1000
}

const fn default_flush_timer() -> Duration {
    Duration::from_secs(10)
}

/// The normalized configuration object. The file syntax itself is plain
/// serde; anything dynamic goes through the typetag registries.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub targets: IndexMap<String, TargetConfig>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub subscriptions: IndexMap<String, SubscriptionConfig>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, OutputOuter>,

    /// Named processor definitions; the kind is the single top-level key of
    /// each mapping.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub processors: IndexMap<String, Box<dyn ProcessorConfig>>,

    /// Named action definitions for the trigger processor.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub actions: IndexMap<String, Box<dyn crate::pipeline::ActionConfig>>,

    /// Message-bus inputs; carried in the config view, consumed elsewhere.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader: Option<Box<dyn LoaderConfig>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<ClusteringConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server: Option<ApiServerConfig>,

    /// Settings for an embedded gNMI server; serving it is delegated, the
    /// section is carried for the config API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gnmi_server: Option<serde_json::Value>,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> crate::Result<Config> {
        let path = path.as_ref();
        let format = Format::from_path(path);
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| format!("read {}: {}", path.display(), err))?;

        Self::parse(&content, format)
    }

    pub fn parse(content: &str, format: Format) -> crate::Result<Config> {
        let mut value: serde_yaml::Value = format.deserialize(content)?;
        apply_env_overrides(&mut value, ENV_PREFIX);

        let config: Config = serde_yaml::from_value(value).map_err(|err| err.to_string())?;
        config.validate()?;

        Ok(config)
    }

    /// Cross-section checks. Anything wrong here is fatal at startup.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, tc) in &self.targets {
            for sub in &tc.subscriptions {
                if !self.subscriptions.contains_key(sub) {
                    return Err(format!(
                        "target {name:?} references unknown subscription {sub:?}"
                    )
                    .into());
                }
            }
        }

        for (name, output) in &self.outputs {
            for proc in &output.event_processors {
                if !self.processors.contains_key(proc) {
                    return Err(
                        format!("output {name:?} references unknown processor {proc:?}").into(),
                    );
                }
            }
        }

        if let Some(clustering) = &self.clustering {
            if clustering.cluster_name.is_empty() {
                return Err("clustering.cluster-name must not be empty".into());
            }
        }

        Ok(())
    }

    /// Subscriptions a target opens: the named subset, or all of them.
    pub fn target_subscriptions(&self, tc: &TargetConfig) -> Vec<SubscriptionConfig> {
        let mut out = Vec::new();

        if tc.subscriptions.is_empty() {
            for (name, sc) in &self.subscriptions {
                let mut sc = sc.clone();
                sc.name = name.clone();
                out.push(sc);
            }
            return out;
        }

        for name in &tc.subscriptions {
            if let Some(sc) = self.subscriptions.get(name) {
                let mut sc = sc.clone();
                sc.name = name.clone();
                out.push(sc);
            }
        }

        out
    }
}

/// The live target map. Many readers (API handlers, the dispatcher), few
/// writers (loader diff apply, admin API). The guard is never held across
/// I/O.
pub type TargetStore = Arc<RwLock<IndexMap<String, Arc<TargetConfig>>>>;

pub fn target_store(targets: &IndexMap<String, TargetConfig>) -> TargetStore {
    let map = targets
        .iter()
        .map(|(name, tc)| {
            let mut tc = tc.clone();
            if tc.name.is_empty() {
                tc.name = name.clone();
            }
            (name.clone(), Arc::new(tc))
        })
        .collect();

    Arc::new(RwLock::new(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
targets:
  leaf1:
    address: 10.0.0.1:57400
    username: admin
    password: secret
    subscriptions: [port-stats]
    tags: [region=east, role=leaf]

subscriptions:
  port-stats:
    paths:
      - /interfaces/interface/state/counters
    stream-mode: sample
    sample-interval: 10s

outputs:
  tsdb:
    type: influxdb
    url: http://localhost:8086
    bucket: telemetry
    event-processors: [drop-noise]
    batch-size: 500

processors:
  drop-noise:
    drop:
      tag-names: ["^noise"]

api-server:
  address: 127.0.0.1:7890
  enable-metrics: true

clustering:
  cluster-name: collectors
  locker:
    type: mem
"#;

    #[test]
    fn parse_sample() {
        let config = Config::parse(SAMPLE, Format::Yaml).unwrap();

        assert_eq!(config.targets["leaf1"].address, "10.0.0.1:57400");
        assert_eq!(
            config.targets["leaf1"].tags,
            vec!["region=east", "role=leaf"]
        );
        assert_eq!(
            config.subscriptions["port-stats"].sample_interval,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.outputs["tsdb"].batch_size, 500);
        assert_eq!(config.outputs["tsdb"].event_processors, vec!["drop-noise"]);
        assert!(config.clustering.is_some());
    }

    #[test]
    fn unknown_subscription_is_fatal() {
        let bad = SAMPLE.replace("subscriptions: [port-stats]", "subscriptions: [nope]");
        assert!(Config::parse(&bad, Format::Yaml).is_err());
    }

    #[test]
    fn unknown_processor_is_fatal() {
        let bad = SAMPLE.replace("event-processors: [drop-noise]", "event-processors: [nope]");
        assert!(Config::parse(&bad, Format::Yaml).is_err());
    }

    #[test]
    fn redaction() {
        let config = Config::parse(SAMPLE, Format::Yaml).unwrap();
        let tc = config.targets["leaf1"].redacted();
        assert_eq!(tc.password.as_deref(), Some("****"));
    }

    #[test]
    fn target_subscriptions_default_to_all() {
        let mut config = Config::parse(SAMPLE, Format::Yaml).unwrap();
        config.targets.get_mut("leaf1").unwrap().subscriptions = vec![];

        let subs = config.target_subscriptions(&config.targets["leaf1"]);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].name, "port-stats");
    }
}
