use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{run_poll_loop, Loader, LoaderConfig, LoaderContext};
use crate::config::{Format, TargetConfig};

/// Re-reads a targets file on an interval and emits the diff. The file is
/// a map of target name to target config, YAML or JSON by extension.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileLoaderConfig {
    pub path: PathBuf,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

const fn default_interval() -> Duration {
    Duration::from_secs(30)
}

#[async_trait]
#[typetag::serde(name = "file")]
impl LoaderConfig for FileLoaderConfig {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader> {
        let path = self.path.clone();
        let format = Format::from_path(&path);
        let interval = self.interval;

        Ok(Box::pin(run_poll_loop(
            "file",
            interval,
            move || {
                let path = path.clone();
                async move {
                    let content = tokio::fs::read_to_string(&path)
                        .await
                        .map_err(|err| format!("read {}: {}", path.display(), err))?;

                    let targets: HashMap<String, TargetConfig> = format.deserialize(&content)?;
                    Ok(targets)
                }
            },
            cx.out,
            cx.shutdown,
        )))
    }
}
