use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request};
use http_body_util::Full;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};

use super::{Action, ActionConfig};
use crate::event::Event;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Sends the triggering event as JSON to an HTTP endpoint.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HttpActionConfig {
    url: String,

    #[serde(default = "default_method")]
    method: String,

    #[serde(default = "default_timeout", with = "humantime_serde")]
    timeout: Duration,
}

#[typetag::serde(name = "http")]
impl ActionConfig for HttpActionConfig {
    fn build(&self) -> crate::Result<Box<dyn Action>> {
        let method = Method::from_str(&self.method.to_uppercase())?;
        let uri: http::Uri = self.url.parse()?;
        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Box::new(HttpAction {
            client,
            method,
            uri,
            timeout: self.timeout,
        }))
    }
}

struct HttpAction {
    client: Client<HttpConnector, Full<Bytes>>,
    method: Method,
    uri: http::Uri,
    timeout: Duration,
}

impl std::fmt::Debug for HttpAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAction")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Action for HttpAction {
    async fn run(&self, event: &Event) -> crate::Result<serde_json::Value> {
        let body = serde_json::to_vec(event)?;
        let request = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(request)).await??;

        Ok(serde_json::json!({
            "url": self.uri.to_string(),
            "status": response.status().as_u16(),
        }))
    }
}
