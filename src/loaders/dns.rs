use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};

use super::{run_poll_loop, Loader, LoaderConfig, LoaderContext};
use crate::config::TargetConfig;

/// Discovers targets from DNS SRV records. Each SRV answer becomes one
/// target named `host:port`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DnsLoaderConfig {
    /// SRV names to resolve, e.g. `_gnmi._tcp.lab.example.net`.
    pub names: Vec<String>,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

const fn default_interval() -> Duration {
    Duration::from_secs(60)
}

#[async_trait]
#[typetag::serde(name = "dns")]
impl LoaderConfig for DnsLoaderConfig {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader> {
        let (config, options) = hickory_resolver::system_conf::read_system_conf()
            .map_err(|err| format!("read system DNS config: {err}"))?;
        let resolver = TokioAsyncResolver::tokio(config, options);
        let names = self.names.clone();

        Ok(Box::pin(run_poll_loop(
            "dns",
            self.interval,
            move || {
                let resolver = resolver.clone();
                let names = names.clone();

                async move {
                    let mut targets = HashMap::new();

                    for name in &names {
                        let lookup = resolver
                            .srv_lookup(name.as_str())
                            .await
                            .map_err(|err| format!("SRV lookup {name}: {err}"))?;

                        for srv in lookup.iter() {
                            let host = srv.target().to_utf8();
                            let host = host.trim_end_matches('.');
                            let address = format!("{}:{}", host, srv.port());

                            targets.insert(
                                address.clone(),
                                TargetConfig {
                                    name: address.clone(),
                                    address,
                                    ..Default::default()
                                },
                            );
                        }
                    }

                    Ok(targets)
                }
            },
            cx.out,
            cx.shutdown,
        )))
    }
}
