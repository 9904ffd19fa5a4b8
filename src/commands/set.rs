//! `gnmic set`

use std::collections::BTreeMap;
use std::sync::Arc;

use argh::FromArgs;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use gnmic::collector::{Collector, CollectorConfig};
use gnmic::config::AppConfig;
use gnmic::format::Format;
use gnmic::proto::gnmi::{
    typed_value, SetRequest, SetResponse, TypedValue, Update, UpdateResult,
};
use gnmic::xpath;

use super::{exit_code_for, print_prefix, RootCommand, CONFIG_ERROR, RPC_ERROR, SUCCESS};

const VALUE_TYPES: &str = "json, json_ietf, string, int, uint, bool, float, bytes, ascii, decimal";

/// run a gNMI Set against the targets
#[derive(FromArgs)]
#[argh(subcommand, name = "set")]
pub struct SetCommand {
    /// set request prefix
    #[argh(option)]
    pub prefix: Option<String>,

    /// path to delete, repeatable
    #[argh(option)]
    pub delete: Vec<String>,

    /// inline update `path:::type:::value`, repeatable
    #[argh(option)]
    pub update: Vec<String>,

    /// inline replace `path:::type:::value`, repeatable
    #[argh(option)]
    pub replace: Vec<String>,

    /// update path, paired with --update-value or --update-file
    #[argh(option)]
    pub update_path: Vec<String>,

    /// replace path, paired with --replace-value or --replace-file
    #[argh(option)]
    pub replace_path: Vec<String>,

    /// update value for the matching --update-path
    #[argh(option)]
    pub update_value: Vec<String>,

    /// replace value for the matching --replace-path
    #[argh(option)]
    pub replace_value: Vec<String>,

    /// file with a JSON update value for the matching --update-path
    #[argh(option)]
    pub update_file: Vec<String>,

    /// file with a JSON replace value for the matching --replace-path
    #[argh(option)]
    pub replace_file: Vec<String>,

    /// delimiter between path, type and value in --update/--replace
    #[argh(option, default = "String::from(\":::\")")]
    pub delimiter: String,
}

#[derive(Debug, Default, Serialize)]
struct SetRspMsg {
    source: String,
    timestamp: i64,
    time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    prefix: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    results: Vec<UpdateResultMsg>,
}

#[derive(Debug, Default, Serialize)]
struct UpdateResultMsg {
    operation: String,
    path: String,
}

impl SetCommand {
    pub async fn run(&self, root: &RootCommand, mut config: AppConfig) -> i32 {
        let request = match self.build_request() {
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
        if config.targets.len() > 1 {
            println!("[warning] running set command on multiple targets");
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
                println!("{prefix}Set Request:");
                println!("{request:#?}");
            }

            let deadline = config.timeout.unwrap_or(gnmic::target::DEFAULT_TIMEOUT);
            let result = tokio::time::timeout(deadline, collector.set(&name, request.clone())).await;
            match result {
                Ok(Ok(response)) => print_set_response(&prefix, &name, &response, config.format),
                Ok(Err(err)) => {
                    error!(message = "set request failed", target = %name, %err);
                    code = code.max(exit_code_for(&err));
                }
                Err(_) => {
                    error!(message = "set request deadline exceeded", target = %name);
                    code = RPC_ERROR;
                }
            }
        }

        code
    }

    fn build_request(&self) -> gnmic::Result<SetRequest> {
        if self.delete.is_empty()
            && self.update.is_empty()
            && self.replace.is_empty()
            && self.update_path.is_empty()
            && self.replace_path.is_empty()
        {
            return Err("no paths provided, use --delete, --update* or --replace*".into());
        }

        let mut request = SetRequest {
            prefix: match &self.prefix {
                Some(prefix) => Some(xpath::parse(prefix)?),
                None => None,
            },
            ..Default::default()
        };

        for path in &self.delete {
            request.delete.push(xpath::parse(path.trim())?);
        }

        for spec in &self.update {
            request.update.push(parse_inline(spec, &self.delimiter)?);
        }
        for spec in &self.replace {
            request.replace.push(parse_inline(spec, &self.delimiter)?);
        }

        let updates = pair_values(
            "update",
            &self.update_path,
            &self.update_value,
            &self.update_file,
        )?;
        request.update.extend(updates);
        let replaces = pair_values(
            "replace",
            &self.replace_path,
            &self.replace_value,
            &self.replace_file,
        )?;
        request.replace.extend(replaces);

        Ok(request)
    }
}

fn parse_inline(spec: &str, delimiter: &str) -> gnmic::Result<Update> {
    let parts: Vec<&str> = spec.splitn(3, delimiter).collect();
    if parts.len() < 3 {
        return Err(format!("{spec:?}: invalid inline update format, expected path{delimiter}type{delimiter}value").into());
    }

    build_update(parts[0], parts[1], parts[2])
}

fn pair_values(
    kind: &str,
    paths: &[String],
    values: &[String],
    files: &[String],
) -> gnmic::Result<Vec<Update>> {
    if paths.is_empty() {
        return Ok(Vec::new());
    }

    if !files.is_empty() {
        if paths.len() != files.len() {
            return Err(format!("missing or extra {kind} files").into());
        }
        return paths
            .iter()
            .zip(files)
            .map(|(path, file)| {
                let data = read_value_file(file)?;
                Ok(Update {
                    path: Some(xpath::parse(path.trim())?),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::JsonVal(data)),
                    }),
                    ..Default::default()
                })
            })
            .collect();
    }

    if paths.len() != values.len() {
        return Err(format!("missing or extra {kind} values").into());
    }
    paths
        .iter()
        .zip(values)
        .map(|(path, value)| build_update(path, "json", value))
        .collect()
}

fn build_update(path: &str, value_type: &str, raw: &str) -> gnmic::Result<Update> {
    let value = match value_type {
        "json" => typed_value::Value::JsonVal(serde_json::to_vec(
            &serde_json::from_str::<serde_json::Value>(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        )?),
        "json_ietf" => typed_value::Value::JsonIetfVal(serde_json::to_vec(
            &serde_json::from_str::<serde_json::Value>(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string())),
        )?),
        "string" => typed_value::Value::StringVal(raw.to_string()),
        "ascii" => typed_value::Value::AsciiVal(raw.to_string()),
        "int" => typed_value::Value::IntVal(raw.parse()?),
        "uint" => typed_value::Value::UintVal(raw.parse()?),
        "bool" => typed_value::Value::BoolVal(raw.parse()?),
        "float" => typed_value::Value::FloatVal(raw.parse()?),
        "bytes" => typed_value::Value::BytesVal(raw.as_bytes().to_vec()),
        "decimal" => {
            // no codec for Decimal64 values yet
            return Err("decimal values are not supported in set requests".into());
        }
        other => {
            return Err(format!("unknown value type {other:?}, must be one of: {VALUE_TYPES}").into())
        }
    };

    Ok(Update {
        path: Some(xpath::parse(path.trim())?),
        val: Some(TypedValue { value: Some(value) }),
        ..Default::default()
    })
}

/// Reads a JSON or YAML value file; YAML is converted to JSON.
fn read_value_file(name: &str) -> gnmic::Result<Vec<u8>> {
    let path = gnmic::config::expand_home(name);
    let data = std::fs::read(&path).map_err(|err| format!("error reading {path:?}: {err}"))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Ok(data),
        Some("yaml") | Some("yml") => {
            let value: serde_yaml::Value = serde_yaml::from_slice(&data)?;
            Ok(serde_json::to_vec(&value)?)
        }
        other => Err(format!("unsupported file format {other:?}").into()),
    }
}

fn print_set_response(prefix: &str, source: &str, response: &SetResponse, format: Format) {
    if format == Format::Textproto {
        println!("{prefix}{response:#?}");
        return;
    }

    let time = DateTime::<Utc>::from_timestamp_nanos(response.timestamp);
    let msg = SetRspMsg {
        source: source.to_string(),
        timestamp: response.timestamp,
        time: time.to_rfc3339_opts(SecondsFormat::Nanos, true),
        prefix: response
            .prefix
            .as_ref()
            .map(xpath::to_string)
            .unwrap_or_default(),
        results: response
            .response
            .iter()
            .map(|result| UpdateResultMsg {
                operation: operation_name(result),
                path: result
                    .path
                    .as_ref()
                    .map(xpath::to_string)
                    .unwrap_or_default(),
            })
            .collect(),
    };

    match serde_json::to_string_pretty(&msg) {
        Ok(body) => println!("{prefix}{body}"),
        Err(err) => error!(message = "failed to marshal the set response", %err),
    }
}

fn operation_name(result: &UpdateResult) -> String {
    gnmic::proto::gnmi::update_result::Operation::try_from(result.op)
        .map(|op| op.as_str_name().to_string())
        .unwrap_or_else(|_| "INVALID".to_string())
}
