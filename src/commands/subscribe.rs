//! `gnmic subscribe`

use std::collections::BTreeMap;
use std::sync::Arc;

use argh::FromArgs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gnmic::collector::{Collector, CollectorConfig};
use gnmic::config::subscriptions::{Mode, StreamMode, SubscriptionConfig};
use gnmic::config::AppConfig;
use gnmic::event::Meta;
use gnmic::format;
use gnmic::outputs::{Output, OutputContext, StdoutOutputConfig};
use gnmic::processors::ProcessorContext;

use super::{exit_code_for, RootCommand, CONFIG_ERROR, INTERRUPTED, RPC_ERROR, SUCCESS};

/// subscribe to telemetry streams from the targets
#[derive(FromArgs)]
#[argh(subcommand, name = "subscribe")]
pub struct SubscribeCommand {
    /// path for an ad-hoc subscription, repeatable; cannot be mixed with --name
    #[argh(option)]
    pub path: Vec<String>,

    /// configured subscription name to use, repeatable
    #[argh(option, short = 'n')]
    pub name: Vec<String>,

    /// subscription prefix for --path
    #[argh(option)]
    pub prefix: Option<String>,

    /// subscription mode: stream, once, poll
    #[argh(option, default = "String::from(\"stream\")")]
    pub mode: String,

    /// stream mode: target-defined, on-change, sample
    #[argh(option, default = "String::from(\"target-defined\")")]
    pub stream_mode: String,

    /// sample interval, e.g. 10s
    #[argh(option)]
    pub sample_interval: Option<String>,

    /// heartbeat interval, e.g. 1m
    #[argh(option)]
    pub heartbeat_interval: Option<String>,

    /// suppress redundant updates
    #[argh(switch)]
    pub suppress_redundant: bool,

    /// only send updates to current state
    #[argh(switch)]
    pub updates_only: bool,

    /// DSCP marking of the subscription
    #[argh(option)]
    pub qos: Option<u32>,

    /// schema model to use, repeatable
    #[argh(option)]
    pub model: Vec<String>,

    /// value for the target field of the subscription prefix
    #[argh(option)]
    pub target: Option<String>,
}

impl SubscribeCommand {
    pub async fn run(&self, _root: &RootCommand, mut config: AppConfig) -> i32 {
        if let Err(err) = self.prepare_subscriptions(&mut config) {
            error!(message = "invalid subscription arguments", %err);
            return CONFIG_ERROR;
        }

        if let Err(err) = config.normalize() {
            error!(message = "configuration error", %err);
            return CONFIG_ERROR;
        }
        if config.subscriptions.is_empty() {
            error!(message = "no subscriptions configured, use --path or --name");
            return CONFIG_ERROR;
        }

        let root_token = CancellationToken::new();

        // processors consult a read-only view of the fleet
        let processor_cx = ProcessorContext {
            targets: Arc::new(
                config
                    .targets
                    .iter()
                    .map(|(name, target)| (name.clone(), target.address.clone()))
                    .collect(),
            ),
        };

        let mut output_configs = std::mem::take(&mut config.outputs);
        if output_configs.is_empty() {
            output_configs.insert("default".to_string(), Box::new(StdoutOutputConfig::default()));
        }

        let output_cx = OutputContext {
            token: root_token.clone(),
            format: config.format,
            processors: Arc::new(std::mem::take(&mut config.processors)),
            processor_cx,
        };

        let mut outputs: BTreeMap<String, Arc<dyn Output>> = BTreeMap::new();
        for (name, output_config) in &output_configs {
            match output_config.build(output_cx.clone()).await {
                Ok(output) => {
                    outputs.insert(name.clone(), output);
                }
                Err(err) => {
                    error!(message = "failed to initialize output", output = %name, %err);
                    return CONFIG_ERROR;
                }
            }
        }

        let subscriptions: BTreeMap<String, Arc<SubscriptionConfig>> = config
            .subscriptions
            .iter()
            .map(|(name, sub)| (name.clone(), Arc::new(sub.clone())))
            .collect();
        let target_configs = config.targets.values().cloned().map(Arc::new).collect();

        let collector = Collector::new(
            CollectorConfig {
                prometheus_address: config.prometheus_address.clone(),
                encoding: config.encoding,
            },
            target_configs,
            subscriptions,
            outputs,
            root_token.child_token(),
        )
        .await;

        let initialized = collector.target_names();
        let mut code = if initialized.len() == config.targets.len() {
            SUCCESS
        } else {
            RPC_ERROR
        };
        if initialized.is_empty() {
            return RPC_ERROR;
        }

        for name in &initialized {
            if let Err(err) = collector.subscribe(name) {
                error!(message = "failed to subscribe", target = %name, %err);
                code = code.max(exit_code_for(&err));
            }
        }

        spawn_poll_loop(Arc::clone(&collector));

        tokio::select! {
            result = collector.start() => {
                if let Err(err) = result {
                    error!(message = "collector terminated", %err);
                    return code.max(exit_code_for(&err));
                }
                info!(message = "all subscriptions done");
                code
            }
            _ = tokio::signal::ctrl_c() => {
                info!(message = "shutdown signal received");
                collector.stop().await;
                INTERRUPTED
            }
        }
    }

    fn prepare_subscriptions(&self, config: &mut AppConfig) -> gnmic::Result<()> {
        if !self.path.is_empty() && !self.name.is_empty() {
            return Err("--path and --name cannot be mixed".into());
        }

        if !self.path.is_empty() {
            let mode = match self.mode.to_lowercase().as_str() {
                "stream" => Mode::Stream,
                "once" => Mode::Once,
                "poll" => Mode::Poll,
                other => return Err(format!("unknown subscription mode {other:?}").into()),
            };
            let stream_mode = match self.stream_mode.to_lowercase().as_str() {
                "target-defined" => StreamMode::TargetDefined,
                "on-change" => StreamMode::OnChange,
                "sample" => StreamMode::Sample,
                other => return Err(format!("unknown stream mode {other:?}").into()),
            };

            let subscription = SubscriptionConfig {
                name: "default".to_string(),
                prefix: self.prefix.clone().unwrap_or_default(),
                target: self.target.clone().unwrap_or_default(),
                paths: self.path.clone(),
                mode,
                stream_mode,
                qos: self.qos,
                sample_interval: self
                    .sample_interval
                    .as_deref()
                    .map(humantime::parse_duration)
                    .transpose()?,
                heartbeat_interval: self
                    .heartbeat_interval
                    .as_deref()
                    .map(humantime::parse_duration)
                    .transpose()?,
                suppress_redundant: self.suppress_redundant,
                updates_only: self.updates_only,
                models: self.model.clone(),
                ..Default::default()
            };

            config.subscriptions.clear();
            config
                .subscriptions
                .insert("default".to_string(), subscription);
            return Ok(());
        }

        if !self.name.is_empty() {
            let mut filtered = BTreeMap::new();
            for name in &self.name {
                match config.subscriptions.remove(name) {
                    Some(subscription) => {
                        filtered.insert(name.clone(), subscription);
                    }
                    None => {
                        return Err(
                            format!("named subscription {name:?} not found in config file").into()
                        )
                    }
                }
            }
            config.subscriptions = filtered;
        }

        Ok(())
    }
}

/// POLL subscriptions are triggered by lines on stdin: an empty line polls
/// everything, `target subscription` polls one stream.
fn spawn_poll_loop(collector: Arc<Collector>) {
    let polled = collector.polled_subscriptions();
    if polled.is_empty() {
        return;
    }

    info!(
        message = "poll subscriptions active, press enter to poll all",
        count = polled.values().map(Vec::len).sum::<usize>(),
    );

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let selection: Vec<&str> = line.split_whitespace().collect();

            for (target, subscriptions) in collector.polled_subscriptions() {
                for subscription in subscriptions {
                    match selection.as_slice() {
                        [] => {}
                        [t] if *t == target => {}
                        [t, s] if *t == target && *s == subscription => {}
                        _ => continue,
                    }

                    match collector.target_poll(&target, &subscription).await {
                        Ok(response) => {
                            let meta = Meta {
                                source: target.clone(),
                                subscription_name: subscription.clone(),
                                system_name: None,
                            };
                            match format::format_response(
                                format::Format::Json,
                                &response,
                                &meta,
                            ) {
                                Ok(Some(body)) => {
                                    println!("{}", String::from_utf8_lossy(&body));
                                }
                                Ok(None) => {}
                                Err(err) => warn!(message = "failed to format poll response", %err),
                            }
                        }
                        Err(err) => {
                            warn!(
                                message = "poll failed",
                                target = %target,
                                subscription = %subscription,
                                %err
                            );
                        }
                    }
                }
            }
        }
    });
}
