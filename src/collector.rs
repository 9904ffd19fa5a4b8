//! The collector owns every target, shepherds their streams and fans
//! responses out to the bound outputs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::subscriptions::{Mode, SubscriptionConfig};
use crate::config::Encoding;
use crate::event::Meta;
use crate::outputs::Output;
use crate::proto::gnmi::{
    subscribe_response, CapabilityRequest, CapabilityResponse, GetRequest, GetResponse, SetRequest,
    SetResponse, SubscribeResponse,
};
use crate::stats;
use crate::target::{StreamErrorKind, Target, TargetConfig};

#[derive(Clone, Debug, Default)]
pub struct CollectorConfig {
    /// Internal metrics listen address; disabled when unset.
    pub prometheus_address: Option<String>,
    pub encoding: Encoding,
}

pub struct Collector {
    config: CollectorConfig,
    subscriptions: BTreeMap<String, Arc<SubscriptionConfig>>,
    outputs: BTreeMap<String, Arc<dyn Output>>,
    targets: Mutex<HashMap<String, Arc<Target>>>,
    dispatchers: TaskTracker,
    token: CancellationToken,
}

impl Collector {
    /// Creates the collector and initializes every target in parallel. A
    /// target that cannot be initialized is logged and left out; it does
    /// not abort the others.
    pub async fn new(
        config: CollectorConfig,
        target_configs: Vec<Arc<TargetConfig>>,
        subscriptions: BTreeMap<String, Arc<SubscriptionConfig>>,
        outputs: BTreeMap<String, Arc<dyn Output>>,
        token: CancellationToken,
    ) -> Arc<Self> {
        let collector = Arc::new(Collector {
            config,
            subscriptions,
            outputs,
            targets: Mutex::new(HashMap::new()),
            dispatchers: TaskTracker::new(),
            token,
        });

        let inits = target_configs.into_iter().map(|tc| {
            let collector = Arc::clone(&collector);
            async move {
                match collector.init_target(tc.clone()).await {
                    Ok(()) => info!(message = "target initialized", target = %tc.name),
                    Err(err) => {
                        error!(message = "failed to initialize target", target = %tc.name, %err);
                    }
                }
            }
        });
        join_all(inits).await;

        collector
    }

    /// Builds one target and inserts it into the map. Initializing a target
    /// that already exists is a no-op.
    pub async fn init_target(&self, config: Arc<TargetConfig>) -> crate::Result<()> {
        if self
            .targets
            .lock()
            .expect("targets lock poisoned")
            .contains_key(&config.name)
        {
            return Ok(());
        }

        // named references, or everything when the target names none
        let subscriptions = resolve(&config.subscriptions, &self.subscriptions, "subscription")?;
        let outputs = if config.outputs.is_empty() {
            self.outputs
                .iter()
                .map(|(name, output)| (name.clone(), Arc::clone(output)))
                .collect()
        } else {
            resolve_outputs(&config.outputs, &self.outputs)?
        };

        let target = Arc::new(Target::new(
            Arc::clone(&config),
            subscriptions,
            outputs,
            self.config.encoding,
            &self.token,
        )?);
        target.probe().await?;

        let mut targets = self.targets.lock().expect("targets lock poisoned");
        if let Some(existing) = targets.get(&config.name) {
            // a concurrent init won the race
            if !Arc::ptr_eq(existing, &target) {
                target.cancel();
            }
            return Ok(());
        }
        targets.insert(config.name.clone(), target);

        Ok(())
    }

    fn target(&self, name: &str) -> crate::Result<Arc<Target>> {
        self.targets
            .lock()
            .expect("targets lock poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| format!("unknown target name {name:?}").into())
    }

    pub fn target_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .targets
            .lock()
            .expect("targets lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Opens the streams for every subscription of the named target.
    pub fn subscribe(&self, target_name: &str) -> crate::Result<()> {
        let target = self.target(target_name)?;
        target.subscribe_all()
    }

    /// Spawns one dispatcher per target, the internal metrics server when
    /// configured, and blocks until every dispatcher has exited.
    pub async fn start(&self) -> crate::Result<()> {
        if let Some(listen) = &self.config.prometheus_address {
            let listener = crate::http::bind(listen).await?;
            crate::http::serve_text(
                listener,
                self.token.child_token(),
                "/metrics".to_string(),
                Arc::new(render_internal_metrics),
            );
        }

        let targets: Vec<Arc<Target>> = self
            .targets
            .lock()
            .expect("targets lock poisoned")
            .values()
            .cloned()
            .collect();

        for target in targets {
            self.dispatchers.spawn(run_dispatcher(target));
        }

        self.dispatchers.close();
        self.dispatchers.wait().await;

        Ok(())
    }

    /// Hot-adds a target: full init, subscriptions and a dispatcher.
    pub async fn add_target(&self, config: Arc<TargetConfig>) -> crate::Result<()> {
        let name = config.name.clone();
        self.init_target(config).await?;
        self.subscribe(&name)?;

        let target = self.target(&name)?;
        self.dispatchers.spawn(run_dispatcher(target));

        Ok(())
    }

    /// Hot-removes a target: cancels its context and drops it from the map.
    /// The stream readers and dispatcher observe the cancellation and exit.
    pub fn delete_target(&self, name: &str) -> crate::Result<()> {
        let removed = self
            .targets
            .lock()
            .expect("targets lock poisoned")
            .remove(name);

        match removed {
            Some(target) => {
                target.cancel();
                info!(message = "target deleted", target = %name);
                Ok(())
            }
            None => Err(format!("unknown target name {name:?}").into()),
        }
    }

    pub async fn capabilities(&self, target_name: &str) -> crate::Result<CapabilityResponse> {
        let target = self.target(target_name)?;
        let response = target
            .client()
            .capabilities(CapabilityRequest::default())
            .await?;
        Ok(response.into_inner())
    }

    /// Unary Get through the target's client. The caller's deadline applies.
    pub async fn get(&self, target_name: &str, request: GetRequest) -> crate::Result<GetResponse> {
        let target = self.target(target_name)?;
        let response = target.client().get(request).await?;
        Ok(response.into_inner())
    }

    /// Unary Set through the target's client. The caller's deadline applies.
    pub async fn set(&self, target_name: &str, request: SetRequest) -> crate::Result<SetResponse> {
        let target = self.target(target_name)?;
        let response = target.client().set(request).await?;
        Ok(response.into_inner())
    }

    /// Triggers a poll on a POLL subscription and returns the next response.
    pub async fn target_poll(
        &self,
        target_name: &str,
        subscription_name: &str,
    ) -> crate::Result<SubscribeResponse> {
        let subscription = self
            .subscriptions
            .get(subscription_name)
            .ok_or_else(|| format!("unknown subscription name {subscription_name:?}"))?;
        if subscription.mode != Mode::Poll {
            return Err(
                format!("subscription {subscription_name:?} is not a POLL subscription").into(),
            );
        }

        let target = self.target(target_name)?;
        target.poll(subscription_name).await
    }

    /// Target name to list of POLL subscription names.
    pub fn polled_subscriptions(&self) -> BTreeMap<String, Vec<String>> {
        let targets = self.targets.lock().expect("targets lock poisoned");
        let mut result = BTreeMap::new();
        for (name, target) in targets.iter() {
            let polled: Vec<String> = target
                .subscriptions
                .iter()
                .filter(|sub| sub.mode == Mode::Poll)
                .map(|sub| sub.name.clone())
                .collect();
            if !polled.is_empty() {
                result.insert(name.clone(), polled);
            }
        }
        result
    }

    /// Cancels the root context and closes every output. Targets and their
    /// streams observe the cancellation.
    pub async fn stop(&self) {
        self.token.cancel();
        for (name, output) in &self.outputs {
            debug!(message = "closing output", output = %name);
            output.close().await;
        }
    }
}

fn resolve(
    names: &[String],
    registry: &BTreeMap<String, Arc<SubscriptionConfig>>,
    kind: &str,
) -> crate::Result<Vec<Arc<SubscriptionConfig>>> {
    if names.is_empty() {
        return Ok(registry.values().cloned().collect());
    }

    names
        .iter()
        .map(|name| {
            registry
                .get(name)
                .cloned()
                .ok_or_else(|| format!("unknown {kind} name {name:?}").into())
        })
        .collect()
}

fn resolve_outputs(
    names: &[String],
    registry: &BTreeMap<String, Arc<dyn Output>>,
) -> crate::Result<Vec<(String, Arc<dyn Output>)>> {
    names
        .iter()
        .map(|name| {
            registry
                .get(name)
                .map(|output| (name.clone(), Arc::clone(output)))
                .ok_or_else(|| format!("unknown output name {name:?}").into())
        })
        .collect()
}

/// The per-target loop: responses fan out to the bound outputs, errors are
/// logged, and the task exits once every ONCE subscription has seen its
/// sync marker (when the target has nothing else).
async fn run_dispatcher(target: Arc<Target>) {
    let Some(mut response_rx) = target
        .response_rx
        .lock()
        .expect("response receiver lock poisoned")
        .take()
    else {
        return;
    };
    let Some(mut error_rx) = target
        .error_rx
        .lock()
        .expect("error receiver lock poisoned")
        .take()
    else {
        return;
    };

    let modes: HashMap<&str, Mode> = target
        .subscriptions
        .iter()
        .map(|sub| (sub.name.as_str(), sub.mode))
        .collect();
    let num_once = target
        .subscriptions
        .iter()
        .filter(|sub| sub.mode == Mode::Once)
        .count();
    let all_once = num_once == target.subscriptions.len();
    let mut remaining_once = num_once;

    loop {
        tokio::select! {
            _ = target.token.cancelled() => return,

            tagged = response_rx.recv() => {
                let Some(tagged) = tagged else { return };
                stats::RESPONSES.inc();

                let meta = Meta {
                    source: target.name().to_string(),
                    subscription_name: tagged.subscription.clone(),
                    system_name: None,
                };

                // serial per event; concurrency lives across targets
                for (name, output) in &target.outputs {
                    trace!(
                        message = "writing response",
                        target = %target.name(),
                        output = %name,
                    );
                    output.write(&tagged.response, &meta).await;
                }

                if remaining_once > 0
                    && modes.get(tagged.subscription.as_str()) == Some(&Mode::Once)
                    && matches!(
                        tagged.response.response,
                        Some(subscribe_response::Response::SyncResponse(_))
                    )
                {
                    remaining_once -= 1;
                }
                if num_once > 0 && remaining_once == 0 && all_once {
                    debug!(message = "all ONCE subscriptions done", target = %target.name());
                    return;
                }
            }

            error = error_rx.recv() => {
                let Some(error) = error else { return };
                match error.kind {
                    StreamErrorKind::Eof => {
                        warn!(
                            message = "subscription closed stream (EOF)",
                            target = %target.name(),
                            subscription = %error.subscription,
                        );
                    }
                    StreamErrorKind::Rpc(status) => {
                        warn!(
                            message = "subscription stream error",
                            target = %target.name(),
                            subscription = %error.subscription,
                            %status,
                        );
                    }
                }
            }
        }
    }
}

fn render_internal_metrics() -> String {
    let mut out = String::new();
    for (name, value) in [
        ("gnmic_subscribe_responses_total", stats::RESPONSES.get()),
        ("gnmic_stream_errors_total", stats::STREAM_ERRORS.get()),
        ("gnmic_decode_failures_total", stats::DECODE_FAILURES.get()),
    ] {
        out.push_str("# TYPE ");
        out.push_str(name);
        out.push_str(" counter\n");
        out.push_str(name);
        out.push(' ');
        out.push_str(&value.to_string());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::proto::gnmi::{typed_value, Notification, TypedValue, Update};

    #[derive(Debug, Default)]
    struct RecordingOutput {
        written: StdMutex<Vec<(String, String, i64)>>,
    }

    #[async_trait]
    impl Output for RecordingOutput {
        async fn write(&self, rsp: &SubscribeResponse, meta: &Meta) {
            let value = match &rsp.response {
                Some(subscribe_response::Response::Update(n)) => n.timestamp,
                _ => -1,
            };
            self.written.lock().unwrap().push((
                meta.source.clone(),
                meta.subscription_name.clone(),
                value,
            ));
        }

        async fn close(&self) {}
    }

    fn update_response(timestamp: i64) -> SubscribeResponse {
        SubscribeResponse {
            response: Some(subscribe_response::Response::Update(Notification {
                timestamp,
                update: vec![Update {
                    path: Some(crate::xpath::parse("/a/b/c").unwrap()),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::IntVal(timestamp)),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            })),
        }
    }

    fn sync_response() -> SubscribeResponse {
        SubscribeResponse {
            response: Some(subscribe_response::Response::SyncResponse(true)),
        }
    }

    fn subscription(name: &str, mode: Mode) -> Arc<SubscriptionConfig> {
        Arc::new(SubscriptionConfig {
            name: name.to_string(),
            paths: vec!["/a/b/c".to_string()],
            mode,
            ..Default::default()
        })
    }

    fn test_target(
        name: &str,
        subscriptions: Vec<Arc<SubscriptionConfig>>,
        output: Arc<RecordingOutput>,
    ) -> Arc<Target> {
        let config = Arc::new(TargetConfig {
            name: name.to_string(),
            address: "127.0.0.1:57400".to_string(),
            insecure: true,
            ..Default::default()
        });
        Arc::new(
            Target::new(
                config,
                subscriptions,
                vec![("recorder".to_string(), output)],
                Encoding::Json,
                &CancellationToken::new(),
            )
            .unwrap(),
        )
    }

    async fn push(
        tx: &tokio::sync::mpsc::Sender<crate::target::TaggedResponse>,
        subscription: &str,
        response: SubscribeResponse,
    ) {
        tx.send(crate::target::TaggedResponse {
            subscription: subscription.to_string(),
            response,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn fan_out_preserves_per_target_order() {
        let output_a = Arc::new(RecordingOutput::default());
        let output_b = Arc::new(RecordingOutput::default());
        let target_a = test_target("A", vec![subscription("s1", Mode::Stream)], output_a.clone());
        let target_b = test_target("B", vec![subscription("s1", Mode::Stream)], output_b.clone());

        let (tx_a, _) = target_a.test_channels();
        let (tx_b, _) = target_b.test_channels();

        let dispatcher_a = tokio::spawn(run_dispatcher(Arc::clone(&target_a)));
        let dispatcher_b = tokio::spawn(run_dispatcher(Arc::clone(&target_b)));

        for value in [1, 2, 3] {
            push(&tx_a, "s1", update_response(value)).await;
        }
        for value in [10, 20] {
            push(&tx_b, "s1", update_response(value)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        target_a.cancel();
        target_b.cancel();
        let _ = dispatcher_a.await;
        let _ = dispatcher_b.await;

        let written_a = output_a.written.lock().unwrap();
        let written_b = output_b.written.lock().unwrap();
        assert_eq!(written_a.len(), 3);
        assert_eq!(written_b.len(), 2);
        assert_eq!(
            written_a.iter().map(|(_, _, v)| *v).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            written_b.iter().map(|(_, _, v)| *v).collect::<Vec<_>>(),
            vec![10, 20]
        );
        assert!(written_a.iter().all(|(source, _, _)| source == "A"));
    }

    #[tokio::test]
    async fn all_once_dispatcher_exits_after_last_sync() {
        let output = Arc::new(RecordingOutput::default());
        let target = test_target(
            "A",
            vec![
                subscription("once_a", Mode::Once),
                subscription("once_b", Mode::Once),
            ],
            output.clone(),
        );
        let (tx, _) = target.test_channels();

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&target)));

        push(&tx, "once_a", update_response(1)).await;
        push(&tx, "once_a", sync_response()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_finished(), "one ONCE subscription pending");

        push(&tx, "once_b", update_response(2)).await;
        push(&tx, "once_b", sync_response()).await;

        tokio::time::timeout(Duration::from_secs(1), dispatcher)
            .await
            .expect("dispatcher should exit after the last sync response")
            .unwrap();
    }

    #[tokio::test]
    async fn mixed_once_and_stream_target_stays_alive() {
        let output = Arc::new(RecordingOutput::default());
        let target = test_target(
            "A",
            vec![
                subscription("once_a", Mode::Once),
                subscription("stream_b", Mode::Stream),
            ],
            output.clone(),
        );
        let (tx, _) = target.test_channels();

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&target)));

        push(&tx, "once_a", update_response(1)).await;
        push(&tx, "once_a", sync_response()).await;
        push(&tx, "stream_b", update_response(2)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            !dispatcher.is_finished(),
            "mixed target must stay alive after ONCE completion"
        );

        push(&tx, "stream_b", update_response(3)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(output.written.lock().unwrap().len(), 4);

        target.cancel();
        let _ = dispatcher.await;
    }

    #[tokio::test]
    async fn stream_error_does_not_stop_dispatcher() {
        let output = Arc::new(RecordingOutput::default());
        let target = test_target("A", vec![subscription("s1", Mode::Stream)], output.clone());
        let (tx, err_tx) = target.test_channels();

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&target)));

        err_tx
            .send(crate::target::StreamError {
                subscription: "s1".to_string(),
                kind: StreamErrorKind::Eof,
            })
            .await
            .unwrap();
        push(&tx, "s1", update_response(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!dispatcher.is_finished());
        assert_eq!(output.written.lock().unwrap().len(), 1);

        target.cancel();
        let _ = dispatcher.await;
    }

    #[tokio::test]
    async fn init_target_is_idempotent() {
        let collector = Collector::new(
            CollectorConfig::default(),
            Vec::new(),
            BTreeMap::new(),
            BTreeMap::new(),
            CancellationToken::new(),
        )
        .await;

        // a target that a successful first init would have registered
        let output = Arc::new(RecordingOutput::default());
        let target = test_target("A", vec![subscription("s1", Mode::Stream)], output);
        collector
            .targets
            .lock()
            .unwrap()
            .insert("A".to_string(), Arc::clone(&target));

        // the second init must short-circuit on the name before dialing;
        // this config points at a dead port and would fail a real init
        let config = Arc::new(TargetConfig {
            name: "A".to_string(),
            address: "127.0.0.1:1".to_string(),
            insecure: true,
            timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        collector.init_target(config).await.unwrap();

        assert_eq!(collector.target_names(), vec!["A".to_string()]);
        let existing = collector.target("A").unwrap();
        assert!(Arc::ptr_eq(&existing, &target), "target must not be replaced");
    }

    #[tokio::test]
    async fn add_target_fails_fast_for_unreachable_target() {
        let collector = Collector::new(
            CollectorConfig::default(),
            Vec::new(),
            BTreeMap::new(),
            BTreeMap::new(),
            CancellationToken::new(),
        )
        .await;

        let config = Arc::new(TargetConfig {
            name: "dead".to_string(),
            // nothing listens here; the probe fails with a transport error
            address: "127.0.0.1:1".to_string(),
            insecure: true,
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        });

        let err = collector.add_target(config).await.unwrap_err();
        let mut found = false;
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err.as_ref());
        while let Some(current) = source {
            if current.is::<crate::target::ConnectError>() {
                found = true;
                break;
            }
            source = current.source();
        }
        assert!(found, "expected a connect error, got: {err}");

        assert!(collector.target_names().is_empty());
        assert!(collector.delete_target("dead").is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_dispatcher_within_grace() {
        let output = Arc::new(RecordingOutput::default());
        let target = test_target("A", vec![subscription("s1", Mode::Stream)], output);

        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&target)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        target.cancel();
        tokio::time::timeout(Duration::from_secs(1), dispatcher)
            .await
            .expect("dispatcher must observe cancellation within the grace period")
            .unwrap();
    }
}
