//! `gnmic get`

use std::collections::BTreeMap;
use std::sync::Arc;

use argh::FromArgs;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use gnmic::collector::{Collector, CollectorConfig};
use gnmic::config::AppConfig;
use gnmic::format::Format;
use gnmic::proto::gnmi::{get_request::DataType, GetRequest, GetResponse, ModelData};
use gnmic::value::Value;
use gnmic::xpath;

use super::{exit_code_for, print_prefix, RootCommand, CONFIG_ERROR, RPC_ERROR, SUCCESS};

/// run a gNMI Get against the targets
#[derive(FromArgs)]
#[argh(subcommand, name = "get")]
pub struct GetCommand {
    /// path to get, repeatable, required
    #[argh(option)]
    pub path: Vec<String>,

    /// path prefix
    #[argh(option)]
    pub prefix: Option<String>,

    /// schema model to use, repeatable
    #[argh(option)]
    pub model: Vec<String>,

    /// data type: all, config, state, operational
    #[argh(option, short = 't', default = "String::from(\"all\")")]
    pub r#type: String,

    /// value for the target field of the prefix
    #[argh(option)]
    pub target: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct GetRspMsg {
    source: String,
    timestamp: i64,
    time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    prefix: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    updates: Vec<UpdateMsg>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    deletes: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct UpdateMsg {
    #[serde(rename = "Path")]
    path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    values: BTreeMap<String, Value>,
}

impl GetCommand {
    pub async fn run(&self, root: &RootCommand, mut config: AppConfig) -> i32 {
        if self.path.is_empty() {
            error!(message = "no paths provided, use --path");
            return CONFIG_ERROR;
        }

        let request = match self.build_request(&config) {
            Ok(request) => request,
            Err(err) => {
                error!(message = "invalid request arguments", %err);
                return CONFIG_ERROR;
            }
        };

        if let Err(err) = config.normalize() {
            error!(message = "configuration error", %err);
            return CONFIG_ERROR;
        }

        let target_configs = config.targets.values().cloned().map(Arc::new).collect();
        let subscriptions = config
            .subscriptions
            .iter()
            .map(|(name, sub)| (name.clone(), Arc::new(sub.clone())))
            .collect();
        let collector = Collector::new(
            CollectorConfig {
                prometheus_address: None,
                encoding: config.encoding,
            },
            target_configs,
            subscriptions,
            BTreeMap::new(),
            CancellationToken::new(),
        )
        .await;

        let initialized = collector.target_names();
        let mut code = if initialized.len() == config.targets.len() {
            SUCCESS
        } else {
            RPC_ERROR
        };

        for name in initialized {
            let prefix = print_prefix(&config, root.no_prefix, &name);
            if root.print_request {
                println!("{prefix}Get Request:");
                println!("{:#?}", request);
            }

            let deadline = config.timeout.unwrap_or(gnmic::target::DEFAULT_TIMEOUT);
            let result = tokio::time::timeout(deadline, collector.get(&name, request.clone())).await;
            match result {
                Ok(Ok(response)) => print_get_response(&prefix, &name, &response, config.format),
                Ok(Err(err)) => {
                    error!(message = "get request failed", target = %name, %err);
                    code = code.max(exit_code_for(&err));
                }
                Err(_) => {
                    error!(message = "get request deadline exceeded", target = %name);
                    code = RPC_ERROR;
                }
            }
        }

        code
    }

    fn build_request(&self, config: &AppConfig) -> gnmic::Result<GetRequest> {
        let mut prefix = match &self.prefix {
            Some(prefix) => xpath::parse(prefix)?,
            None => Default::default(),
        };
        if let Some(target) = &self.target {
            prefix.target.clone_from(target);
        }

        let r#type = match self.r#type.to_lowercase().as_str() {
            "all" => DataType::All,
            "config" => DataType::Config,
            "state" => DataType::State,
            "operational" => DataType::Operational,
            other => return Err(format!("unknown data type {other:?}").into()),
        };

        Ok(GetRequest {
            prefix: Some(prefix),
            path: self
                .path
                .iter()
                .map(|path| xpath::parse(path))
                .collect::<Result<Vec<_>, _>>()?,
            r#type: r#type as i32,
            encoding: config.encoding.to_proto() as i32,
            use_models: self
                .model
                .iter()
                .map(|name| ModelData {
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
        })
    }
}

fn print_get_response(prefix: &str, source: &str, response: &GetResponse, format: Format) {
    if format == Format::Textproto {
        println!("{prefix}{response:#?}");
        return;
    }

    for notification in &response.notification {
        let time = DateTime::<Utc>::from_timestamp_nanos(notification.timestamp);
        let mut msg = GetRspMsg {
            source: source.to_string(),
            timestamp: notification.timestamp,
            time: time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            prefix: notification
                .prefix
                .as_ref()
                .map(xpath::to_string)
                .unwrap_or_default(),
            ..Default::default()
        };

        for update in &notification.update {
            let Some(path) = update.path.as_ref() else {
                continue;
            };

            let mut values = BTreeMap::new();
            if let Some(val) = update.val.as_ref() {
                match gnmic::value::decode(val) {
                    Ok(value) => {
                        values.insert(xpath::elements_to_string(&path.elem), value);
                    }
                    Err(err) => warn!(message = "failed to decode value", %err),
                }
            }

            msg.updates.push(UpdateMsg {
                path: xpath::to_string(path),
                values,
            });
        }
        for delete in &notification.delete {
            msg.deletes.push(xpath::to_string(delete));
        }

        match serde_json::to_string_pretty(&msg) {
            Ok(body) => println!("{prefix}{body}"),
            Err(err) => error!(message = "failed to marshal the get response", %err),
        }
    }
}
