//! End-to-end configuration loading: YAML with targets, subscriptions,
//! typetag-dispatched outputs and processors.

use std::time::Duration;

use gnmic::config::subscriptions::{Mode, StreamMode};
use gnmic::config::{AppConfig, Encoding};
use gnmic::format::Format;

const FULL_CONFIG: &str = r#"
username: admin
password: secret
port: 57400
encoding: json_ietf
format: event
timeout: 10s
retry: 5s
target-buffer-size: 500
prometheus-address: ":9091"
skip-verify: true

targets:
  leaf1:
    address: 10.0.0.1
    subscriptions: [ports]
    outputs: [prom]
  leaf2:
    address: 10.0.0.2:6030
    username: other
    insecure: true

subscriptions:
  ports:
    paths:
      - /interfaces/interface/state/counters
    mode: stream
    stream-mode: sample
    sample-interval: 10s
  system:
    paths:
      - /system/name
    mode: once

outputs:
  prom:
    type: prometheus
    listen: "127.0.0.1:9804"
    expiration: 2m
    append-subscription-name: false
  out-file:
    type: file
    filename: /tmp/gnmic-out.json
  console:
    type: stdout

processors:
  alarm:
    type: event-trigger
    condition: "values./interfaces/interface/state/counters/in-errors > 100"
    max-occurrences: 3
    window: 30s
    action:
      type: log
      prefix: in-errors
"#;

#[test]
fn full_config_round_trip() {
    let mut config: AppConfig = serde_yaml::from_str(FULL_CONFIG).unwrap();
    config.normalize().unwrap();

    assert_eq!(config.encoding, Encoding::JsonIetf);
    assert_eq!(config.format, Format::Event);
    assert_eq!(config.timeout, Some(Duration::from_secs(10)));
    assert_eq!(config.prometheus_address.as_deref(), Some(":9091"));

    // globals flow into the targets
    let leaf1 = &config.targets["leaf1"];
    assert_eq!(leaf1.address, "10.0.0.1:57400");
    assert_eq!(leaf1.username.as_deref(), Some("admin"));
    assert_eq!(leaf1.retry, Some(Duration::from_secs(5)));
    assert_eq!(leaf1.buffer_size, Some(500));
    assert!(leaf1.tls.as_ref().unwrap().skip_verify);

    let leaf2 = &config.targets["leaf2"];
    assert_eq!(leaf2.username.as_deref(), Some("other"));
    assert!(leaf2.insecure);

    let ports = &config.subscriptions["ports"];
    assert_eq!(ports.mode, Mode::Stream);
    assert_eq!(ports.stream_mode, StreamMode::Sample);
    assert_eq!(ports.sample_interval, Some(Duration::from_secs(10)));

    let system = &config.subscriptions["system"];
    assert_eq!(system.mode, Mode::Once);

    // plugin tables dispatched on their type tags
    assert_eq!(config.outputs.len(), 3);
    assert!(config.outputs.contains_key("prom"));
    assert!(config.outputs.contains_key("out-file"));
    assert!(config.processors.contains_key("alarm"));
}

#[test]
fn unknown_output_type_is_an_error() {
    let result: Result<AppConfig, _> = serde_yaml::from_str(
        r#"
outputs:
  broken:
    type: carrier-pigeon
"#,
    );
    assert!(result.is_err());
}

#[test]
fn invalid_subscription_is_rejected_at_normalize() {
    let mut config: AppConfig = serde_yaml::from_str(
        r#"
address: [10.0.0.1]
subscriptions:
  bad:
    paths: [/a/b]
    mode: stream
    stream-mode: sample
"#,
    )
    .unwrap();

    let err = config.normalize().unwrap_err();
    assert!(err.to_string().contains("sample-interval"));
}

#[test]
fn port_applies_to_portless_addresses() {
    let mut config: AppConfig = serde_yaml::from_str(
        r#"
port: 6030
address: [10.0.0.1, "10.0.0.2:57400"]
"#,
    )
    .unwrap();
    config.normalize().unwrap();

    assert_eq!(config.targets["10.0.0.1"].address, "10.0.0.1:6030");
    assert_eq!(config.targets["10.0.0.2:57400"].address, "10.0.0.2:57400");
}
