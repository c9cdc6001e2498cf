//! Actions a trigger can run. Each action receives the firing event, the
//! outputs of the actions that ran before it, and the trigger's shared
//! vars. The script DSL of richer deployments is out of scope; actions
//! here are plain HTTP calls and whatever tests plug in.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Buf;
use http::Request;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::event::EventMsg;
use crate::http::{body, read_body, Auth, HttpClient};

pub struct ActionContext<'a> {
    pub input: &'a EventMsg,
    /// Outputs of prior actions in this firing, keyed by action name.
    pub env: &'a Map<String, Value>,
    pub vars: &'a Value,
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cx: ActionContext<'_>) -> crate::Result<Value>;
}

pub type SharedAction = Arc<dyn Action>;

/// Registry of action kinds, keyed by the `type` field of each named
/// definition under `actions`.
#[typetag::serde(tag = "type")]
pub trait ActionConfig: Debug + Send + Sync {
    fn build(&self, name: &str) -> crate::Result<Box<dyn Action>>;
}

/// POSTs the firing context as JSON.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpActionConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
}

fn default_method() -> String {
    "POST".to_string()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

#[typetag::serde(name = "http")]
impl ActionConfig for HttpActionConfig {
    fn build(&self, name: &str) -> crate::Result<Box<dyn Action>> {
        let method = http::Method::from_bytes(self.method.as_bytes())
            .map_err(|err| format!("invalid method {:?}: {err}", self.method))?;

        Ok(Box::new(HttpAction {
            name: name.to_string(),
            url: self.url.clone(),
            method,
            timeout: self.timeout,
            auth: self.auth.clone(),
            client: HttpClient::new(None)?,
        }))
    }
}

struct HttpAction {
    name: String,
    url: String,
    method: http::Method,
    timeout: Duration,
    auth: Option<Auth>,
    client: HttpClient,
}

#[async_trait]
impl Action for HttpAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cx: ActionContext<'_>) -> crate::Result<Value> {
        let payload = json!({
            "input": cx.input,
            "env": cx.env,
            "vars": cx.vars,
        });

        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .header("Content-Type", "application/json")
            .body(body(payload.to_string().into_bytes()))
            .map_err(|err| err.to_string())?;
        if let Some(auth) = &self.auth {
            auth.apply(&mut req);
        }

        let resp = self.client.send_with_deadline(req, self.timeout).await?;
        let (parts, incoming) = resp.into_parts();
        let content = read_body(incoming).await?;

        if !parts.status.is_success() {
            return Err(format!("action {:?} got status {}", self.name, parts.status).into());
        }

        Ok(serde_json::from_slice(content.chunk())
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(content.chunk()).into_owned())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_action_from_config() {
        let raw = r#"{"type": "http", "url": "http://hook.local/fire", "method": "PUT"}"#;
        let config: Box<dyn ActionConfig> = serde_json::from_str(raw).unwrap();
        let action = config.build("notify").unwrap();
        assert_eq!(action.name(), "notify");
    }

    #[test]
    fn bad_method_is_fatal() {
        let config = HttpActionConfig {
            url: "http://hook.local".into(),
            method: "NOT A METHOD".into(),
            timeout: default_timeout(),
            auth: None,
        };
        assert!(config.build("notify").is_err());
    }
}
