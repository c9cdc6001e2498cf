use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::{name_targets, Loader, LoaderConfig, LoaderContext, TargetOperation};
use crate::config::TargetConfig;

/// A fixed fleet: the configured map is emitted once as the initial
/// snapshot and never changes afterwards.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StaticLoaderConfig {
    pub targets: IndexMap<String, TargetConfig>,
}

#[async_trait]
#[typetag::serde(name = "static")]
impl LoaderConfig for StaticLoaderConfig {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader> {
        let targets: HashMap<String, TargetConfig> = self
            .targets
            .iter()
            .map(|(name, tc)| (name.clone(), tc.clone()))
            .collect();

        let LoaderContext {
            out, mut shutdown, ..
        } = cx;

        Ok(Box::pin(async move {
            let op = TargetOperation {
                add: name_targets(targets),
                del: Vec::new(),
            };

            if out.send(op).await.is_err() {
                return Ok(());
            }

            (&mut shutdown).await;
            Ok(())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn emits_initial_snapshot_once() {
        let raw = r#"
type: static
targets:
  leaf1:
    address: 10.0.0.1:57400
  leaf2: {}
"#;
        let config: Box<dyn LoaderConfig> = serde_yaml::from_str(raw).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let loader = config
            .build(LoaderContext {
                out: tx,
                shutdown: ShutdownSignal::noop(),
                locker: None,
            })
            .await
            .unwrap();
        tokio::spawn(loader);

        let op = rx.recv().await.unwrap();
        assert_eq!(op.add.len(), 2);
        assert!(op.del.is_empty());
        assert_eq!(op.add["leaf1"].address, "10.0.0.1:57400");
        // a nameless entry picks up its map key as name and address
        assert_eq!(op.add["leaf2"].name, "leaf2");
        assert_eq!(op.add["leaf2"].address, "leaf2");

        // nothing further
        assert!(tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }
}
