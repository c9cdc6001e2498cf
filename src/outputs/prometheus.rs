//! Scrape-style sink: events fold into a labeled gauge state served in
//! the Prometheus text format on a dedicated listener.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::{OutputConfig, Sink};
use crate::event::EventMsg;
use crate::http::body;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PrometheusOutputConfig {
    pub listen: SocketAddr,

    #[serde(default = "default_path")]
    pub path: String,
}

fn default_path() -> String {
    "/metrics".to_string()
}

#[derive(Clone, Copy)]
struct Sample {
    value: f64,
    timestamp_ms: i64,
}

type State = Arc<Mutex<BTreeMap<String, Sample>>>;

#[async_trait]
#[typetag::serde(name = "prometheus")]
impl OutputConfig for PrometheusOutputConfig {
    async fn build(&self, name: &str, shutdown: ShutdownSignal) -> crate::Result<Arc<dyn Sink>> {
        let state: State = Arc::new(Mutex::new(BTreeMap::new()));

        let listener = TcpListener::bind(self.listen)
            .await
            .map_err(|err| format!("bind {}: {err}", self.listen))?;

        info!(
            message = "prometheus output listening",
            output = %name,
            address = %self.listen,
        );

        tokio::spawn(serve(
            listener,
            self.path.clone(),
            Arc::clone(&state),
            shutdown,
        ));

        Ok(Arc::new(PrometheusSink { state }))
    }
}

async fn serve(listener: TcpListener, path: String, state: State, mut shutdown: ShutdownSignal) {
    loop {
        let (stream, _peer) = tokio::select! {
            _ = &mut shutdown => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(message = "accept new connection failed", %err);
                    continue;
                }
            }
        };

        let path = path.clone();
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let path = path.clone();
                let state = Arc::clone(&state);

                async move {
                    let resp = if req.uri().path() == path {
                        Response::builder()
                            .header("Content-Type", "text/plain; version=0.0.4")
                            .body(body(render(&state).into_bytes()))
                    } else {
                        Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(body(Vec::new()))
                    };

                    resp.map_err(|err| err.to_string())
                }
            });

            let builder = Builder::new(TokioExecutor::new());
            if let Err(err) = builder
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                trace!(message = "failed to serve scrape connection", %err);
            }
        });
    }
}

fn render(state: &State) -> String {
    let mut out = String::new();
    for (series, sample) in state.lock().iter() {
        out.push_str(series);
        out.push(' ');
        out.push_str(&sample.value.to_string());
        out.push(' ');
        out.push_str(&sample.timestamp_ms.to_string());
        out.push('\n');
    }
    out
}

struct PrometheusSink {
    state: State,
}

fn sanitize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, ch) in s.trim_start_matches('/').chars().enumerate() {
        match ch {
            'a'..='z' | 'A'..='Z' | '_' | ':' => out.push(ch),
            '0'..='9' if i > 0 => out.push(ch),
            _ => out.push('_'),
        }
    }
    out
}

/// `<event-name>_<value-path>{sorted tags}`; non-numeric values are
/// skipped, the text format carries numbers only.
fn series_of(event: &EventMsg, key: &str) -> String {
    let mut series = sanitize(&event.name);
    series.push('_');
    series.push_str(&sanitize(key));

    if event.tags.is_empty() {
        return series;
    }

    let mut tags: Vec<(&String, &String)> = event.tags.iter().collect();
    tags.sort();

    series.push('{');
    for (i, (key, value)) in tags.iter().enumerate() {
        if i > 0 {
            series.push(',');
        }
        series.push_str(&sanitize(key));
        series.push_str("=\"");
        series.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
        series.push('"');
    }
    series.push('}');

    series
}

#[async_trait]
impl Sink for PrometheusSink {
    async fn write_batch(&self, batch: Vec<EventMsg>) -> crate::Result<()> {
        let mut state = self.state.lock();

        for event in &batch {
            let timestamp_ms = event.timestamp / 1_000_000;

            for (key, value) in &event.values {
                let Some(value) = value.as_f64() else {
                    continue;
                };

                state.insert(
                    series_of(event, key),
                    Sample {
                        value,
                        timestamp_ms,
                    },
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use indexmap::IndexMap;

    fn event() -> EventMsg {
        EventMsg {
            name: "port-stats".into(),
            timestamp: 1_700_000_000_000_000_000,
            tags: IndexMap::from([("interface".to_string(), "ethernet1/1".to_string())]),
            values: IndexMap::from([
                (
                    "/interfaces/interface/state/counters/in-octets".to_string(),
                    Value::Uint(1024),
                ),
                ("oper-state".to_string(), Value::String("UP".to_string())),
            ]),
            deletes: vec![],
        }
    }

    #[tokio::test]
    async fn folds_numeric_values_into_series() {
        let state: State = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = PrometheusSink {
            state: Arc::clone(&state),
        };

        sink.write_batch(vec![event()]).await.unwrap();

        let rendered = render(&state);
        assert_eq!(
            rendered,
            "port_stats_interfaces_interface_state_counters_in_octets{interface=\"ethernet1/1\"} 1024 1700000000000\n"
        );
    }

    #[tokio::test]
    async fn later_write_overwrites_series() {
        let state: State = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = PrometheusSink {
            state: Arc::clone(&state),
        };

        sink.write_batch(vec![event()]).await.unwrap();

        let mut updated = event();
        updated
            .values
            .insert(
                "/interfaces/interface/state/counters/in-octets".to_string(),
                Value::Uint(2048),
            );
        sink.write_batch(vec![updated]).await.unwrap();

        assert!(render(&state).contains(" 2048 "));
        assert_eq!(state.lock().len(), 1);
    }

    #[test]
    fn sanitize_keeps_legal_chars() {
        assert_eq!(sanitize("in-octets"), "in_octets");
        assert_eq!(sanitize("/a/b-c/9"), "a_b_c_9");
    }
}
