//! The canonical event form that flows through processors and outputs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::proto::gnmi::{subscribe_response::Response, Notification, Path, SubscribeResponse};
use crate::value::{self, Value};
use crate::{stats, xpath};

/// Per-message metadata attached by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct Meta {
    pub source: String,
    pub subscription_name: String,
    pub system_name: Option<String>,
}

/// A normalized telemetry event. `name` is the subscription name, `source`
/// and the list-predicate components live in `tags`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<String>,
}

/// Converts a subscribe response into events, one per update plus one
/// carrying the deletes. Sync markers and (deprecated) error responses
/// produce no events. Updates whose value cannot be decoded are dropped.
pub fn response_to_events(rsp: &SubscribeResponse, meta: &Meta) -> Vec<Event> {
    match &rsp.response {
        Some(Response::Update(notification)) => notification_to_events(notification, meta),
        _ => Vec::new(),
    }
}

fn notification_to_events(notification: &Notification, meta: &Meta) -> Vec<Event> {
    let mut events = Vec::with_capacity(notification.update.len() + 1);
    let prefix = notification.prefix.as_ref();

    for update in &notification.update {
        let Some(path) = update.path.as_ref() else {
            continue;
        };
        let Some(val) = update.val.as_ref() else {
            continue;
        };

        let decoded = match value::decode(val) {
            Ok(decoded) => decoded,
            Err(err) => {
                stats::DECODE_FAILURES.inc();
                warn!(message = "failed to decode update value", %err);
                continue;
            }
        };

        let mut tags = BTreeMap::new();
        if let Some(prefix) = prefix {
            collect_key_tags(prefix, &mut tags);
        }
        collect_key_tags(path, &mut tags);
        insert_meta_tags(meta, &mut tags);

        let mut leaf = prefix.map(|p| xpath::elements_to_string(&p.elem)).unwrap_or_default();
        leaf.push_str(&xpath::elements_to_string(&path.elem));

        events.push(Event {
            name: meta.subscription_name.clone(),
            timestamp: notification.timestamp,
            tags,
            values: BTreeMap::from([(leaf, decoded)]),
            deletes: Vec::new(),
        });
    }

    if !notification.delete.is_empty() {
        let mut tags = BTreeMap::new();
        if let Some(prefix) = prefix {
            collect_key_tags(prefix, &mut tags);
        }
        insert_meta_tags(meta, &mut tags);

        let prefix_str = prefix.map(xpath::to_string).unwrap_or_default();
        let deletes = notification
            .delete
            .iter()
            .map(|path| format!("{prefix_str}{}", xpath::to_string(path)))
            .collect();

        events.push(Event {
            name: meta.subscription_name.clone(),
            timestamp: notification.timestamp,
            tags,
            values: BTreeMap::new(),
            deletes,
        });
    }

    events
}

/// List-predicate components become tags. The bare key name wins the slot
/// on first use; a conflicting later occurrence is stored under
/// `<element>_<key>` instead.
fn collect_key_tags(path: &Path, tags: &mut BTreeMap<String, String>) {
    for elem in &path.elem {
        for (key, value) in &elem.key {
            match tags.get(key) {
                None => {
                    tags.insert(key.clone(), value.clone());
                }
                Some(existing) if existing == value => {}
                Some(_) => {
                    tags.insert(format!("{}_{}", elem.name, key), value.clone());
                }
            }
        }
    }
}

fn insert_meta_tags(meta: &Meta, tags: &mut BTreeMap<String, String>) {
    tags.insert("source".to_string(), meta.source.clone());
    tags.insert(
        "subscription-name".to_string(),
        meta.subscription_name.clone(),
    );
    if let Some(system_name) = &meta.system_name {
        tags.insert("system-name".to_string(), system_name.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::gnmi::{typed_value, PathElem, TypedValue, Update};

    fn notification() -> Notification {
        Notification {
            timestamp: 1_600_000_000_000_000_000,
            prefix: Some(crate::xpath::parse("/interfaces/interface[name=eth0]").unwrap()),
            update: vec![
                Update {
                    path: Some(crate::xpath::parse("state/counters/in-octets").unwrap()),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::UintVal(123)),
                    }),
                    ..Default::default()
                },
                Update {
                    path: Some(crate::xpath::parse("state/oper-status").unwrap()),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::StringVal("UP".into())),
                    }),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn meta() -> Meta {
        Meta {
            source: "leaf1".into(),
            subscription_name: "ports".into(),
            system_name: None,
        }
    }

    #[test]
    fn update_per_event() {
        let rsp = SubscribeResponse {
            response: Some(Response::Update(notification())),
        };

        let events = response_to_events(&rsp, &meta());
        assert_eq!(events.len(), 2);

        let first = &events[0];
        assert_eq!(first.name, "ports");
        assert_eq!(first.timestamp, 1_600_000_000_000_000_000);
        assert_eq!(first.tags["name"], "eth0");
        assert_eq!(first.tags["source"], "leaf1");
        assert_eq!(first.tags["subscription-name"], "ports");
        assert_eq!(
            first.values["/interfaces/interface/state/counters/in-octets"],
            Value::Uint(123)
        );

        assert_eq!(
            events[1].values["/interfaces/interface/state/oper-status"],
            Value::String("UP".into())
        );
    }

    #[test]
    fn deletes_become_an_event() {
        let mut notification = notification();
        notification.update.clear();
        notification.delete = vec![crate::xpath::parse("state/counters").unwrap()];

        let rsp = SubscribeResponse {
            response: Some(Response::Update(notification)),
        };

        let events = response_to_events(&rsp, &meta());
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].deletes,
            vec!["/interfaces/interface[name=eth0]/state/counters".to_string()]
        );
    }

    #[test]
    fn sync_response_yields_nothing() {
        let rsp = SubscribeResponse {
            response: Some(Response::SyncResponse(true)),
        };
        assert!(response_to_events(&rsp, &meta()).is_empty());
    }

    #[test]
    fn duplicate_keys_get_qualified() {
        let mut tags = BTreeMap::new();
        let path = Path {
            elem: vec![
                PathElem {
                    name: "a".into(),
                    key: BTreeMap::from([("name".to_string(), "x".to_string())]),
                },
                PathElem {
                    name: "b".into(),
                    key: BTreeMap::from([("name".to_string(), "y".to_string())]),
                },
            ],
            ..Default::default()
        };

        collect_key_tags(&path, &mut tags);
        assert_eq!(tags["name"], "x");
        assert_eq!(tags["b_name"], "y");
    }
}
