//! One remote device: its connection, subscription streams and channels.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::Uri;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::config::subscriptions::{Mode, SubscriptionConfig};
use crate::config::Encoding;
use crate::outputs::Output;
use crate::proto::gnmi::{
    subscribe_request, subscribe_response, CapabilityRequest, Poll, SubscribeRequest,
    SubscribeResponse,
};
use crate::proto::GNmiClient;
use crate::tls::TlsConfig;

pub const DEFAULT_PORT: u16 = 57400;
pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type HttpsClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, tonic::body::BoxBody>;

pub type GnmiClient = GNmiClient<InterceptedService<BoxBodyClient, AuthInterceptor>>;

/// Adapts [`HttpsClient`]'s `hyper::body::Incoming` response body to the
/// `tonic::body::BoxBody` that tonic's generated client code requires.
#[derive(Clone)]
pub struct BoxBodyClient(HttpsClient);

impl tonic::codegen::Service<http::Request<tonic::body::BoxBody>> for BoxBodyClient {
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = Box<dyn std::error::Error + Send + Sync>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: http::Request<tonic::body::BoxBody>) -> Self::Future {
        let fut = self.0.call(req);
        Box::pin(async move {
            let res = fut.await?;
            Ok(res.map(|body| {
                tonic::body::BoxBody::new(
                    http_body_util::BodyExt::map_err(body, |e| tonic::Status::from_error(Box::new(e))),
                )
            }))
        })
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Filled from the map key at load time.
    #[serde(skip)]
    pub name: String,

    /// `host:port`; the default port is applied when missing. Falls back to
    /// the target name when empty.
    #[serde(default)]
    pub address: String,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Plaintext instead of TLS.
    #[serde(default)]
    pub insecure: bool,

    pub tls: Option<TlsConfig>,

    /// Dial and init deadline.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Per-subscription stream reopen delay; zero disables retries.
    #[serde(default, with = "humantime_serde")]
    pub retry: Option<Duration>,

    /// Response channel capacity.
    pub buffer_size: Option<usize>,

    pub max_msg_size: Option<usize>,

    /// Subscription names; empty means all configured subscriptions.
    #[serde(default)]
    pub subscriptions: Vec<String>,

    /// Output names; empty means all configured outputs.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl TargetConfig {
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BUFFER_SIZE)
    }

    pub fn retry(&self) -> Duration {
        self.retry.unwrap_or(Duration::ZERO)
    }

    /// The dial address with the default port applied when missing.
    pub fn dial_address(&self) -> String {
        let address = if self.address.is_empty() {
            &self.name
        } else {
            &self.address
        };

        if address.contains(':') {
            address.clone()
        } else {
            format!("{address}:{DEFAULT_PORT}")
        }
    }
}

/// A failure to establish the target transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("target {target:?}: init timeout ({timeout:?}) reached")]
    Timeout { target: String, timeout: Duration },

    #[error("target {target:?}: {status}")]
    Rpc {
        target: String,
        #[source]
        status: Status,
    },
}

/// Attaches `username`/`password` call metadata, the way the protocol's
/// reference clients authenticate.
#[derive(Clone)]
pub struct AuthInterceptor(Option<Arc<AuthInner>>);

struct AuthInner {
    username: MetadataValue<Ascii>,
    password: MetadataValue<Ascii>,
}

impl AuthInterceptor {
    pub fn new(username: Option<&str>, password: Option<&str>) -> crate::Result<Self> {
        if username.is_none() && password.is_none() {
            return Ok(AuthInterceptor(None));
        }

        let inner = AuthInner {
            username: MetadataValue::try_from(username.unwrap_or_default())?,
            password: MetadataValue::try_from(password.unwrap_or_default())?,
        };
        Ok(AuthInterceptor(Some(Arc::new(inner))))
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut req: Request<()>) -> Result<Request<()>, Status> {
        let Some(auth) = &self.0 else {
            return Ok(req);
        };

        let metadata = req.metadata_mut();
        metadata.insert("username", auth.username.clone());
        metadata.insert("password", auth.password.clone());

        Ok(req)
    }
}

/// A response tagged with the subscription it arrived on.
#[derive(Debug)]
pub struct TaggedResponse {
    pub subscription: String,
    pub response: SubscribeResponse,
}

/// A stream error surfaced to the dispatcher.
#[derive(Debug)]
pub struct StreamError {
    pub subscription: String,
    pub kind: StreamErrorKind,
}

#[derive(Debug)]
pub enum StreamErrorKind {
    /// End of stream.
    Eof,
    Rpc(Status),
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamErrorKind::Eof => write!(f, "EOF"),
            StreamErrorKind::Rpc(status) => write!(f, "{status}"),
        }
    }
}

#[derive(Clone)]
struct StreamHandle {
    request_tx: mpsc::Sender<SubscribeRequest>,
    poll_tx: mpsc::UnboundedSender<oneshot::Sender<SubscribeResponse>>,
}

pub struct Target {
    pub config: Arc<TargetConfig>,
    pub subscriptions: Vec<Arc<SubscriptionConfig>>,
    pub(crate) outputs: Vec<(String, Arc<dyn Output>)>,

    client: GnmiClient,
    pub(crate) token: CancellationToken,

    response_tx: mpsc::Sender<TaggedResponse>,
    pub(crate) response_rx: Mutex<Option<mpsc::Receiver<TaggedResponse>>>,
    error_tx: mpsc::Sender<StreamError>,
    pub(crate) error_rx: Mutex<Option<mpsc::Receiver<StreamError>>>,

    streams: Mutex<HashMap<String, StreamHandle>>,
    default_encoding: Encoding,
}

impl Target {
    /// Builds the client and channels. The transport itself is lazy; call
    /// [`Target::probe`] to force a round trip within the init deadline.
    pub fn new(
        config: Arc<TargetConfig>,
        subscriptions: Vec<Arc<SubscriptionConfig>>,
        outputs: Vec<(String, Arc<dyn Output>)>,
        default_encoding: Encoding,
        parent: &CancellationToken,
    ) -> crate::Result<Self> {
        let client = create_client(&config)?;

        let buffer = config.buffer_size();
        let (response_tx, response_rx) = mpsc::channel(buffer);
        let (error_tx, error_rx) = mpsc::channel(buffer);

        Ok(Target {
            config,
            subscriptions,
            outputs,
            client,
            token: parent.child_token(),
            response_tx,
            response_rx: Mutex::new(Some(response_rx)),
            error_tx,
            error_rx: Mutex::new(Some(error_rx)),
            streams: Mutex::new(HashMap::new()),
            default_encoding,
        })
    }

    /// Verifies the target is reachable with a Capabilities round trip.
    pub async fn probe(&self) -> crate::Result<()> {
        let timeout = self.config.timeout();
        let mut client = self.client();

        let response = tokio::time::timeout(timeout, client.capabilities(CapabilityRequest::default()))
            .await
            .map_err(|_| ConnectError::Timeout {
                target: self.name().to_string(),
                timeout,
            })?
            .map_err(|status| ConnectError::Rpc {
                target: self.name().to_string(),
                status,
            })?;

        debug!(
            message = "capabilities probe succeeded",
            target = %self.name(),
            version = %response.get_ref().g_nmi_version,
        );

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// A clone of the underlying client for unary calls.
    pub fn client(&self) -> GnmiClient {
        self.client.clone()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Opens one stream per subscription; each runs until a terminal state
    /// or cancellation.
    pub fn subscribe_all(self: &Arc<Self>) -> crate::Result<()> {
        for subscription in self.subscriptions.clone() {
            let request = subscription.subscribe_request(self.default_encoding)?;
            self.spawn_subscription(subscription, request);
        }
        Ok(())
    }

    fn spawn_subscription(
        self: &Arc<Self>,
        sub: Arc<SubscriptionConfig>,
        request: SubscribeRequest,
    ) {
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        // the request sender is replaced on every (re)connect
        let (request_tx, _) = mpsc::channel(1);
        self.streams.lock().expect("streams lock poisoned").insert(
            sub.name.clone(),
            StreamHandle {
                request_tx,
                poll_tx,
            },
        );

        let target = Arc::clone(self);
        tokio::spawn(async move {
            target.run_subscription(sub, request, poll_rx).await;
        });
    }

    /// The per-stream state machine: open, receive, retry on error when
    /// configured, stop on cancellation, EOF or a ONCE sync marker.
    async fn run_subscription(
        self: Arc<Self>,
        sub: Arc<SubscriptionConfig>,
        request: SubscribeRequest,
        mut poll_rx: mpsc::UnboundedReceiver<oneshot::Sender<SubscribeResponse>>,
    ) {
        let retry = self.config.retry();

        'connect: loop {
            let (request_tx, request_rx) = mpsc::channel(2);
            if request_tx.try_send(request.clone()).is_err() {
                return;
            }
            if let Some(handle) = self
                .streams
                .lock()
                .expect("streams lock poisoned")
                .get_mut(&sub.name)
            {
                handle.request_tx = request_tx;
            }

            let mut client = self.client();
            let result = tokio::select! {
                _ = self.token.cancelled() => return,
                result = client.subscribe(ReceiverStream::new(request_rx)) => result,
            };

            let mut stream = match result {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    self.report_error(&sub.name, StreamErrorKind::Rpc(status)).await;
                    if retry.is_zero() || !self.sleep_before_retry(retry).await {
                        return;
                    }
                    continue 'connect;
                }
            };

            debug!(
                message = "subscription stream opened",
                target = %self.name(),
                subscription = %sub.name,
            );

            loop {
                let message = tokio::select! {
                    _ = self.token.cancelled() => return,
                    message = stream.message() => message,
                };

                match message {
                    Ok(Some(response)) => {
                        let is_sync = matches!(
                            response.response,
                            Some(subscribe_response::Response::SyncResponse(_))
                        );

                        if let Ok(waiter) = poll_rx.try_recv() {
                            let _ = waiter.send(response);
                        } else {
                            let tagged = TaggedResponse {
                                subscription: sub.name.clone(),
                                response,
                            };
                            tokio::select! {
                                _ = self.token.cancelled() => return,
                                result = self.response_tx.send(tagged) => {
                                    if result.is_err() {
                                        return;
                                    }
                                }
                            }
                        }

                        if is_sync && sub.mode == Mode::Once {
                            return;
                        }
                    }
                    Ok(None) => {
                        self.report_error(&sub.name, StreamErrorKind::Eof).await;
                        return;
                    }
                    Err(status) => {
                        self.report_error(&sub.name, StreamErrorKind::Rpc(status)).await;
                        if retry.is_zero() || !self.sleep_before_retry(retry).await {
                            return;
                        }
                        continue 'connect;
                    }
                }
            }
        }
    }

    /// Returns false when cancelled during the backoff sleep.
    async fn sleep_before_retry(&self, retry: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(retry) => true,
        }
    }

    async fn report_error(&self, subscription: &str, kind: StreamErrorKind) {
        crate::stats::STREAM_ERRORS.inc();
        let error = StreamError {
            subscription: subscription.to_string(),
            kind,
        };
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.error_tx.send(error) => {}
        }
    }

    /// Sends a poll marker on the named subscription and waits for the next
    /// response on that stream.
    pub async fn poll(&self, subscription: &str) -> crate::Result<SubscribeResponse> {
        let sub = self
            .subscriptions
            .iter()
            .find(|sub| sub.name == subscription)
            .ok_or_else(|| format!("unknown subscription name {subscription:?}"))?;
        if sub.mode != Mode::Poll {
            return Err(format!("subscription {subscription:?} is not a POLL subscription").into());
        }

        let handle = self
            .streams
            .lock()
            .expect("streams lock poisoned")
            .get(subscription)
            .cloned()
            .ok_or_else(|| format!("no active stream for subscription {subscription:?}"))?;

        let (tx, rx) = oneshot::channel();
        handle
            .poll_tx
            .send(tx)
            .map_err(|_| "subscription stream terminated")?;

        let request = SubscribeRequest {
            request: Some(subscribe_request::Request::Poll(Poll {})),
        };
        handle
            .request_tx
            .send(request)
            .await
            .map_err(|_| "failed to send poll request")?;

        Ok(rx.await.map_err(|_| "poll response not received")?)
    }

    #[cfg(test)]
    pub(crate) fn test_channels(&self) -> (mpsc::Sender<TaggedResponse>, mpsc::Sender<StreamError>) {
        (self.response_tx.clone(), self.error_tx.clone())
    }
}

fn create_client(config: &TargetConfig) -> crate::Result<GnmiClient> {
    let scheme = if config.insecure { "http" } else { "https" };
    let address = config.dial_address();
    let uri = Uri::from_str(&format!("{scheme}://{address}"))?;
    let timeout = config.timeout();

    // the connector decides per URI scheme; plaintext targets never touch
    // the TLS config
    let tls = if config.insecure {
        rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth()
    } else {
        config.tls.clone().unwrap_or_default().client_config()?
    };

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(timeout));

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http2()
        .wrap_connector(http);

    let client = Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build(https);

    let auth = AuthInterceptor::new(config.username.as_deref(), config.password.as_deref())?;
    let service = InterceptedService::new(BoxBodyClient(client), auth);

    let mut client = GNmiClient::with_origin(service, uri);
    if let Some(limit) = config.max_msg_size {
        client = client.max_decoding_message_size(limit);
    }

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_applied() {
        let config = TargetConfig {
            name: "leaf1".into(),
            address: "10.0.0.1".into(),
            ..Default::default()
        };
        assert_eq!(config.dial_address(), "10.0.0.1:57400");

        let config = TargetConfig {
            name: "leaf1".into(),
            address: "10.0.0.1:6030".into(),
            ..Default::default()
        };
        assert_eq!(config.dial_address(), "10.0.0.1:6030");

        // name doubles as the address
        let config = TargetConfig {
            name: "leaf1.lab".into(),
            ..Default::default()
        };
        assert_eq!(config.dial_address(), "leaf1.lab:57400");
    }

    #[test]
    fn buffer_size_floor() {
        let config = TargetConfig::default();
        assert_eq!(config.buffer_size(), DEFAULT_BUFFER_SIZE);

        let config = TargetConfig {
            buffer_size: Some(0),
            ..Default::default()
        };
        assert_eq!(config.buffer_size(), DEFAULT_BUFFER_SIZE);

        let config = TargetConfig {
            buffer_size: Some(5000),
            ..Default::default()
        };
        assert_eq!(config.buffer_size(), 5000);
    }

    #[test]
    fn auth_interceptor_attaches_metadata() {
        let mut interceptor = AuthInterceptor::new(Some("admin"), Some("secret")).unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        assert_eq!(request.metadata().get("username").unwrap(), "admin");
        assert_eq!(request.metadata().get("password").unwrap(), "secret");

        let mut interceptor = AuthInterceptor::new(None, None).unwrap();
        let request = interceptor.call(Request::new(())).unwrap();
        assert!(request.metadata().get("username").is_none());
    }

    #[test]
    fn lazy_client_builds_without_a_server() {
        let config = TargetConfig {
            name: "leaf1".into(),
            address: "127.0.0.1:57400".into(),
            insecure: true,
            ..Default::default()
        };
        assert!(create_client(&config).is_ok());
    }
}
