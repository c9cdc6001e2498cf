use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{run_poll_loop, Loader, LoaderConfig, LoaderContext};
use crate::config::TargetConfig;

/// Discovers targets from the coordination service registry: every alive
/// instance of the named service becomes a target.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct RegistryLoaderConfig {
    /// Service name to watch, e.g. `gnmi-targets`.
    pub service: String,

    /// Only entries carrying all of these `key=value` tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

const fn default_interval() -> Duration {
    Duration::from_secs(30)
}

#[async_trait]
#[typetag::serde(name = "registry")]
impl LoaderConfig for RegistryLoaderConfig {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader> {
        let locker = cx
            .locker
            .clone()
            .ok_or("the registry loader requires clustering to be configured")?;
        let service = self.service.clone();
        let tags = self.tags.clone();

        Ok(Box::pin(run_poll_loop(
            "registry",
            self.interval,
            move || {
                let locker = locker.clone();
                let service = service.clone();
                let tags = tags.clone();

                async move {
                    let entries = locker.get_services(&service, &tags).await?;

                    let mut targets = HashMap::new();
                    for entry in entries {
                        targets.insert(
                            entry.id.clone(),
                            TargetConfig {
                                name: entry.id,
                                address: entry.address,
                                ..Default::default()
                            },
                        );
                    }

                    Ok(targets)
                }
            },
            cx.out,
            cx.shutdown,
        )))
    }
}
