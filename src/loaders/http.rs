use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use http::{Request, StatusCode};
use serde::{Deserialize, Serialize};

use super::{run_poll_loop, Loader, LoaderConfig, LoaderContext};
use crate::config::TargetConfig;
use crate::http::{body, read_body, Auth, HttpClient};
use crate::tls::TlsConfig;

/// Polls a remote endpoint for the full target map. The endpoint answers
/// 200 with a JSON object keyed by target name.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpLoaderConfig {
    pub url: String,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

const fn default_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

#[async_trait]
#[typetag::serde(name = "http")]
impl LoaderConfig for HttpLoaderConfig {
    async fn build(&self, cx: LoaderContext) -> crate::Result<Loader> {
        let client = HttpClient::new(self.tls.as_ref())?;
        let url = self.url.clone();
        let auth = self.auth.clone();
        let timeout = self.timeout;

        Ok(Box::pin(run_poll_loop(
            "http",
            self.interval,
            move || {
                let client = client.clone();
                let url = url.clone();
                let auth = auth.clone();

                async move {
                    let mut req = Request::get(url.as_str())
                        .body(body(Vec::new()))
                        .map_err(|err| err.to_string())?;
                    if let Some(auth) = &auth {
                        auth.apply(&mut req);
                    }

                    let resp = client.send_with_deadline(req, timeout).await?;
                    let (parts, incoming) = resp.into_parts();
                    let content = read_body(incoming).await?;

                    if parts.status != StatusCode::OK {
                        return Err(format!("unexpected status {}", parts.status).into());
                    }

                    let targets: HashMap<String, TargetConfig> =
                        serde_json::from_slice(content.chunk())
                            .map_err(|err| format!("decode target map: {err}"))?;
                    Ok(targets)
                }
            },
            cx.out,
            cx.shutdown,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: HttpLoaderConfig =
            serde_yaml::from_str("url: http://controller/targets").unwrap();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(config.auth.is_none());
    }

    #[test]
    fn wire_format_decodes() {
        // the documented body shape: object keyed by target name, missing
        // fields filled from defaults
        let content = r#"{ "10.10.10.10": {"username": "admin"}, "10.10.10.11": {} }"#;
        let targets: HashMap<String, TargetConfig> = serde_json::from_str(content).unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets["10.10.10.10"].username.as_deref(), Some("admin"));
        assert_eq!(targets["10.10.10.11"].username, None);
    }
}
