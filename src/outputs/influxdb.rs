//! InfluxDB v2 line-protocol sink with an optional on-change cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::{Request, StatusCode};
use serde::{Deserialize, Serialize};

use super::{OutputConfig, Sink};
use crate::cache::CacheConfig;
use crate::event::{EventMsg, Value};
use crate::http::{body, read_body, HttpClient};
use crate::tls::TlsConfig;

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_TAG_VALUE: &str = "true";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    S,
    Ms,
    Us,
    #[default]
    Ns,
}

impl Precision {
    fn query_param(&self) -> &'static str {
        match self {
            Precision::S => "s",
            Precision::Ms => "ms",
            Precision::Us => "us",
            Precision::Ns => "ns",
        }
    }

    fn scale(&self, nanos: i64) -> i64 {
        match self {
            Precision::S => nanos / 1_000_000_000,
            Precision::Ms => nanos / 1_000_000,
            Precision::Us => nanos / 1_000,
            Precision::Ns => nanos,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct InfluxdbOutputConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default)]
    pub timestamp_precision: Precision,

    /// Replace event timestamps with the write-side clock.
    #[serde(default)]
    pub override_timestamps: bool,

    /// When set, delete paths are written as an extra point carrying this
    /// tag; otherwise delete-only events are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_tag: Option<String>,

    /// Write unsigned values as signed integers, for 1.8-compatibility
    /// endpoints that reject the `u` suffix.
    #[serde(default)]
    pub uints_as_ints: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheConfig>,
}

fn default_url() -> String {
    "http://localhost:8086".to_string()
}

#[async_trait]
#[typetag::serde(name = "influxdb")]
impl OutputConfig for InfluxdbOutputConfig {
    async fn build(
        &self,
        _name: &str,
        _shutdown: crate::shutdown::ShutdownSignal,
    ) -> crate::Result<Arc<dyn Sink>> {
        let client = HttpClient::new(self.tls.as_ref())?;
        let base = self.url.trim_end_matches('/');

        Ok(Arc::new(InfluxdbSink {
            client,
            write_url: format!(
                "{}/api/v2/write?org={}&bucket={}&precision={}",
                base,
                self.org,
                self.bucket,
                self.timestamp_precision.query_param(),
            ),
            health_url: format!("{}/health", base),
            token: self.token.clone(),
            encoder: PointEncoder {
                precision: self.timestamp_precision,
                override_timestamps: self.override_timestamps,
                delete_tag: self.delete_tag.clone(),
                uints_as_ints: self.uints_as_ints,
            },
        }))
    }

    fn cache(&self) -> Option<&CacheConfig> {
        self.cache.as_ref()
    }
}

struct InfluxdbSink {
    client: HttpClient,
    write_url: String,
    health_url: String,
    token: Option<String>,
    encoder: PointEncoder,
}

/// Renders events as line protocol, one point per line.
struct PointEncoder {
    precision: Precision,
    override_timestamps: bool,
    delete_tag: Option<String>,
    uints_as_ints: bool,
}

fn escape_measurement(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            ',' | ' ' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn escape_key(out: &mut String, s: &str) {
    for ch in s.chars() {
        match ch {
            ',' | '=' | ' ' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
}

fn push_field_value(out: &mut String, value: &Value, uints_as_ints: bool) {
    match value {
        Value::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        Value::Int(v) => {
            out.push_str(&v.to_string());
            out.push('i');
        }
        Value::Uint(v) if uints_as_ints => {
            out.push_str(&(*v as i64).to_string());
            out.push('i');
        }
        Value::Uint(v) => {
            out.push_str(&v.to_string());
            out.push('u');
        }
        Value::Float(v) => out.push_str(&v.to_string()),
        Value::String(v) => {
            out.push('"');
            for ch in v.chars() {
                match ch {
                    '"' | '\\' => {
                        out.push('\\');
                        out.push(ch);
                    }
                    _ => out.push(ch),
                }
            }
            out.push('"');
        }
    }
}

impl PointEncoder {
    fn timestamp_of(&self, event: &EventMsg) -> i64 {
        let nanos = if event.timestamp == 0 || self.override_timestamps {
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        } else {
            event.timestamp
        };

        self.precision.scale(nanos)
    }

    /// One line per point; the subscription name is the measurement.
    fn encode(&self, events: &[EventMsg]) -> String {
        let mut out = String::new();

        for event in events {
            if !event.values.is_empty() {
                self.encode_point(&mut out, event, None);
            }

            if let (false, Some(delete_tag)) = (event.deletes.is_empty(), &self.delete_tag) {
                self.encode_point(&mut out, event, Some(delete_tag));
            }
        }

        out
    }

    fn encode_point(&self, out: &mut String, event: &EventMsg, delete_tag: Option<&String>) {
        escape_measurement(out, &event.name);

        for (key, value) in &event.tags {
            out.push(',');
            escape_key(out, key);
            out.push('=');
            escape_key(out, value);
        }
        if let Some(delete_tag) = delete_tag {
            out.push(',');
            escape_key(out, delete_tag);
            out.push('=');
            out.push_str(DELETE_TAG_VALUE);
        }

        out.push(' ');

        if delete_tag.is_some() {
            for (i, path) in event.deletes.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                escape_key(out, path);
                out.push_str("=\"\"");
            }
        } else {
            for (i, (key, value)) in event.values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                escape_key(out, key);
                out.push('=');
                push_field_value(out, value, self.uints_as_ints);
            }
        }

        out.push(' ');
        out.push_str(&self.timestamp_of(event).to_string());
        out.push('\n');
    }
}

impl InfluxdbSink {
    fn request(&self, uri: &str, content: Vec<u8>) -> crate::Result<Request<crate::http::Body>> {
        let mut builder = Request::post(uri);
        if let Some(token) = &self.token {
            builder = builder.header("Authorization", format!("Token {token}"));
        }

        builder.body(body(content)).map_err(|err| err.to_string().into())
    }
}

#[async_trait]
impl Sink for InfluxdbSink {
    async fn write_batch(&self, batch: Vec<EventMsg>) -> crate::Result<()> {
        let lines = self.encoder.encode(&batch);
        if lines.is_empty() {
            return Ok(());
        }

        let req = self.request(&self.write_url, lines.into_bytes())?;
        let resp = self.client.send_with_deadline(req, WRITE_TIMEOUT).await?;
        let (parts, incoming) = resp.into_parts();

        if parts.status != StatusCode::NO_CONTENT && !parts.status.is_success() {
            let content = read_body(incoming).await.unwrap_or_default();
            return Err(format!(
                "write rejected with {}: {}",
                parts.status,
                String::from_utf8_lossy(&content)
            )
            .into());
        }

        Ok(())
    }

    async fn healthy(&self) -> crate::Result<()> {
        let req = Request::get(self.health_url.as_str())
            .body(body(Vec::new()))
            .map_err(|err| err.to_string())?;

        let resp = self
            .client
            .send_with_deadline(req, Duration::from_secs(5))
            .await?;

        if !resp.status().is_success() {
            return Err(format!("health endpoint returned {}", resp.status()).into());
        }

        Ok(())
    }
}
