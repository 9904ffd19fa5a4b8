//! Decode, process and dispatch through the public event pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gnmic::event::{response_to_events, Meta};
use gnmic::processors::{apply_chain, build_chain, ProcessorConfig, ProcessorContext};
use gnmic::proto::gnmi::{
    subscribe_response::Response, typed_value, Notification, SubscribeResponse, TypedValue, Update,
};
use gnmic::value::Value;
use gnmic::xpath;

fn response_with_values(values: &[(&str, i64)]) -> SubscribeResponse {
    SubscribeResponse {
        response: Some(Response::Update(Notification {
            timestamp: 1_700_000_000_000_000_000,
            prefix: Some(xpath::parse("/interfaces/interface[name=eth0]").unwrap()),
            update: values
                .iter()
                .map(|(path, value)| Update {
                    path: Some(xpath::parse(path).unwrap()),
                    val: Some(TypedValue {
                        value: Some(typed_value::Value::IntVal(*value)),
                    }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })),
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
fn responses_decode_into_tagged_events() {
    let rsp = response_with_values(&[("state/in-octets", 100), ("state/out-octets", 200)]);
    let events = response_to_events(&rsp, &meta());

    assert_eq!(events.len(), 2);
    for event in &events {
        assert_eq!(event.name, "ports");
        assert_eq!(event.tags["source"], "leaf1");
        assert_eq!(event.tags["subscription-name"], "ports");
        assert_eq!(event.tags["name"], "eth0");
    }
    assert_eq!(
        events[0].values["/interfaces/interface/state/in-octets"],
        Value::Int(100)
    );
}

#[tokio::test]
async fn trigger_processor_runs_in_a_chain() {
    let config: BTreeMap<String, Box<dyn ProcessorConfig>> = serde_yaml::from_str(
        r#"
alarm:
  type: event-trigger
  condition: "values./interfaces/interface/state/in-errors > 10"
  action:
    type: log
"#,
    )
    .unwrap();

    let cx = ProcessorContext {
        targets: Arc::new(BTreeMap::from([(
            "leaf1".to_string(),
            "10.0.0.1:57400".to_string(),
        )])),
    };
    let mut chain = build_chain(&["alarm".to_string()], &config, &cx).unwrap();

    let rsp = response_with_values(&[("state/in-errors", 42)]);
    let events = response_to_events(&rsp, &meta());

    // the trigger observes but does not drop events
    let out = apply_chain(&mut chain, events.clone());
    assert_eq!(out, events);

    // give the fire-and-forget action a chance to run without panicking
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[test]
fn chain_order_is_config_order() {
    let config: BTreeMap<String, Box<dyn ProcessorConfig>> = serde_yaml::from_str(
        r#"
first:
  type: event-trigger
  condition: "true"
  action:
    type: log
second:
  type: event-trigger
  condition: "false"
  action:
    type: log
"#,
    )
    .unwrap();

    let cx = ProcessorContext::default();
    let chain = build_chain(
        &["second".to_string(), "first".to_string()],
        &config,
        &cx,
    )
    .unwrap();
    assert_eq!(chain.len(), 2);

    let err = build_chain(&["missing".to_string()], &config, &cx).unwrap_err();
    assert!(err.to_string().contains("unknown processor"));
}
