//! Serialization of subscribe responses for text-oriented outputs.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::event::{self, Meta};
use crate::proto::gnmi::{subscribe_response::Response, SubscribeResponse};
use crate::value::{self, Value};
use crate::xpath;

/// The process-wide output encoding.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    Textproto,
    Event,
    Proto,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Format::Json),
            "textproto" => Ok(Format::Textproto),
            "event" => Ok(Format::Event),
            "proto" => Ok(Format::Proto),
            other => Err(format!(
                "unknown format {other:?}, must be one of: json, textproto, event, proto"
            )),
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct Msg {
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,

    #[serde(rename = "system-name", skip_serializing_if = "Option::is_none")]
    system_name: Option<String>,

    #[serde(rename = "subscription-name", skip_serializing_if = "Option::is_none")]
    subscription_name: Option<String>,

    timestamp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,

    #[serde(skip_serializing_if = "String::is_empty")]
    prefix: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    updates: Vec<MsgUpdate>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    deletes: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
struct MsgUpdate {
    #[serde(rename = "Path")]
    path: String,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    values: BTreeMap<String, Value>,
}

/// Serializes one subscribe response. Returns `None` for messages that have
/// no representation in the chosen format (sync markers in `json`).
pub fn format_response(
    format: Format,
    rsp: &SubscribeResponse,
    meta: &Meta,
) -> crate::Result<Option<Vec<u8>>> {
    match format {
        Format::Proto => Ok(Some(rsp.encode_to_vec())),
        Format::Textproto => Ok(Some(format!("{rsp:#?}\n").into_bytes())),
        Format::Event => {
            let events = event::response_to_events(rsp, meta);
            if events.is_empty() {
                return Ok(None);
            }
            Ok(Some(serde_json::to_vec(&events)?))
        }
        Format::Json => {
            let Some(Response::Update(notification)) = &rsp.response else {
                return Ok(None);
            };

            let time = DateTime::<Utc>::from_timestamp_nanos(notification.timestamp);
            let mut msg = Msg {
                source: Some(meta.source.clone()),
                system_name: meta.system_name.clone(),
                subscription_name: Some(meta.subscription_name.clone()),
                timestamp: notification.timestamp,
                time: Some(time.to_rfc3339_opts(SecondsFormat::Nanos, true)),
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
                    match value::decode(val) {
                        Ok(decoded) => {
                            values.insert(xpath::elements_to_string(&path.elem), decoded);
                        }
                        Err(err) => warn!(message = "failed to decode update value", %err),
                    }
                }

                msg.updates.push(MsgUpdate {
                    path: xpath::to_string(path),
                    values,
                });
            }

            for delete in &notification.delete {
                msg.deletes.push(xpath::to_string(delete));
            }

            Ok(Some(serde_json::to_vec(&msg)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::gnmi::{typed_value, Notification, TypedValue, Update};

    fn response() -> SubscribeResponse {
        SubscribeResponse {
            response: Some(Response::Update(Notification {
                timestamp: 1_600_000_000_000_000_000,
                update: vec![Update {
                    path: Some(crate::xpath::parse("/a/b[k=v]/c").unwrap()),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::IntVal(7)),
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            })),
        }
    }

    fn meta() -> Meta {
        Meta {
            source: "leaf1".into(),
            subscription_name: "sub".into(),
            system_name: None,
        }
    }

    #[test]
    fn json_format() {
        let bytes = format_response(Format::Json, &response(), &meta())
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed["source"], "leaf1");
        assert_eq!(parsed["subscription-name"], "sub");
        assert_eq!(parsed["timestamp"], 1_600_000_000_000_000_000i64);
        assert_eq!(parsed["updates"][0]["Path"], "/a/b[k=v]/c");
        assert_eq!(parsed["updates"][0]["values"]["/a/b/c"], 7);
    }

    #[test]
    fn sync_response_is_skipped_in_json() {
        let rsp = SubscribeResponse {
            response: Some(Response::SyncResponse(true)),
        };
        assert!(format_response(Format::Json, &rsp, &meta())
            .unwrap()
            .is_none());
    }

    #[test]
    fn event_format_emits_events() {
        let bytes = format_response(Format::Event, &response(), &meta())
            .unwrap()
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed[0]["name"], "sub");
        assert_eq!(parsed[0]["tags"]["k"], "v");
    }

    #[test]
    fn proto_format_round_trips() {
        let bytes = format_response(Format::Proto, &response(), &meta())
            .unwrap()
            .unwrap();
        let decoded = SubscribeResponse::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, response());
    }
}
