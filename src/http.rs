use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use headers::{Authorization, HeaderMapExt};
use http::header::HeaderValue;
use http::{HeaderMap, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::tls::{TlsConfig, TlsError};

#[derive(Debug, Snafu)]
pub enum HttpError {
    #[snafu(display("Failed to build TLS connector: {source}"))]
    BuildTlsConnector { source: TlsError },
    #[snafu(display("Failed to build HTTP request: {source}"))]
    BuildRequest { source: http::Error },
    #[snafu(display("Failed to make HTTP(S) request: {source}"))]
    CallRequest {
        source: hyper_util::client::legacy::Error,
    },
    #[snafu(display("Failed to read response body: {source}"))]
    ReadBody { source: hyper::Error },
    #[snafu(display("Request did not complete within {timeout:?}"))]
    Deadline { timeout: Duration },
}

pub type Body = Full<Bytes>;

pub fn body(content: impl Into<Bytes>) -> Body {
    Full::new(content.into())
}

/// Shared outgoing HTTP(S) client. Cheap to clone.
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    user_agent: HeaderValue,
}

impl HttpClient {
    pub fn new(tls: Option<&TlsConfig>) -> Result<HttpClient, HttpError> {
        let tls = match tls {
            Some(config) => config.client_config().context(BuildTlsConnectorSnafu)?,
            None => TlsConfig::default()
                .client_config()
                .context(BuildTlsConnectorSnafu)?,
        };

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(Duration::from_secs(5)));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new()).build(https);

        let user_agent = HeaderValue::from_str(&format!("gnmic/{}", crate::get_version()))
            .expect("version is a valid header value");

        Ok(HttpClient { client, user_agent })
    }

    pub async fn send(&self, mut req: Request<Body>) -> Result<Response<Incoming>, HttpError> {
        default_request_headers(&mut req, &self.user_agent);

        let resp = self.client.request(req).await.context(CallRequestSnafu)?;

        debug!(
            message = "HTTP response received",
            status = %resp.status(),
            version = ?resp.version(),
        );

        Ok(resp)
    }

    /// Send with an explicit deadline; every external call has one.
    pub async fn send_with_deadline(
        &self,
        req: Request<Body>,
        timeout: Duration,
    ) -> Result<Response<Incoming>, HttpError> {
        match tokio::time::timeout(timeout, self.send(req)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(HttpError::Deadline { timeout }),
        }
    }
}

pub async fn read_body(body: Incoming) -> Result<Bytes, HttpError> {
    let collected = body.collect().await.context(ReadBodySnafu)?;
    Ok(collected.to_bytes())
}

impl Clone for HttpClient {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

fn default_request_headers<B>(req: &mut Request<B>, ua: &HeaderValue) {
    if !req.headers().contains_key("User-Agent") {
        req.headers_mut().insert("User-Agent", ua.clone());
    }

    if !req.headers().contains_key("Accept-Encoding") {
        req.headers_mut()
            .insert("Accept-Encoding", HeaderValue::from_static("identity"));
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "strategy")]
pub enum Auth {
    Basic { user: String, password: String },

    Bearer { token: String },
}

impl Auth {
    pub fn apply<B>(&self, req: &mut Request<B>) {
        self.apply_headers_map(req.headers_mut());
    }

    pub fn apply_headers_map(&self, map: &mut HeaderMap) {
        match &self {
            Auth::Basic { user, password } => {
                let auth = Authorization::basic(user, password);
                map.typed_insert(auth);
            }

            Auth::Bearer { token } => match Authorization::bearer(token) {
                Ok(auth) => map.typed_insert(auth),
                Err(err) => error!(
                    message = "Invalid bearer token",
                    %err,
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_request_headers_defaults() {
        let ua = HeaderValue::from_static("gnmic");
        let mut req = Request::post("http://example.com").body(()).unwrap();
        default_request_headers(&mut req, &ua);

        assert_eq!(req.headers().get("User-Agent"), Some(&ua));
        assert_eq!(
            req.headers().get("Accept-Encoding"),
            Some(&HeaderValue::from_static("identity"))
        );
    }

    #[test]
    fn test_default_request_headers_does_not_overwrite() {
        let mut req = Request::get("http://example.com")
            .header("Accept-Encoding", "gzip")
            .header("User-Agent", "foo")
            .body(())
            .unwrap();
        default_request_headers(&mut req, &HeaderValue::from_static("gnmic"));
        assert_eq!(
            req.headers().get("Accept-Encoding"),
            Some(&HeaderValue::from_static("gzip"))
        );
        assert_eq!(
            req.headers().get("User-Agent"),
            Some(&HeaderValue::from_static("foo"))
        )
    }

    #[test]
    fn auth_applies_headers() {
        let mut req = Request::get("http://example.com").body(()).unwrap();
        Auth::Basic {
            user: "admin".into(),
            password: "admin".into(),
        }
        .apply(&mut req);
        assert!(req.headers().contains_key("Authorization"));

        let mut req = Request::get("http://example.com").body(()).unwrap();
        Auth::Bearer {
            token: "token".into(),
        }
        .apply(&mut req);
        assert!(req
            .headers()
            .get("Authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Bearer "));
    }
}
