//! Subscription definitions and their wire request form.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Encoding;
use crate::proto::gnmi::{
    subscribe_request, subscription_list, QosMarking, SubscribeRequest, Subscription,
    SubscriptionList, SubscriptionMode,
};
use crate::xpath;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Stream,
    Once,
    Poll,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    #[default]
    TargetDefined,
    OnChange,
    Sample,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct SubscriptionConfig {
    /// Filled from the map key at load time.
    #[serde(skip)]
    pub name: String,

    /// Path prefix applied to every path in the subscription.
    #[serde(default)]
    pub prefix: String,

    /// Either a target name, an explicit address, or empty to apply the
    /// subscription per target.
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub paths: Vec<String>,

    #[serde(default)]
    pub mode: Mode,

    /// Only meaningful when `mode` is `stream`.
    #[serde(default)]
    pub stream_mode: StreamMode,

    /// Wire encoding; falls back to the global encoding when unset.
    pub encoding: Option<Encoding>,

    /// DSCP marking for the subscription.
    pub qos: Option<u32>,

    #[serde(default, with = "humantime_serde")]
    pub sample_interval: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub heartbeat_interval: Option<Duration>,

    #[serde(default)]
    pub suppress_redundant: bool,

    #[serde(default)]
    pub updates_only: bool,

    #[serde(default)]
    pub models: Vec<String>,
}

impl SubscriptionConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.paths.is_empty() {
            return Err(format!("subscription {:?} has no paths", self.name).into());
        }

        for path in &self.paths {
            xpath::parse(path)
                .map_err(|err| format!("subscription {:?}: invalid path {path:?}: {err}", self.name))?;
        }
        if !self.prefix.is_empty() {
            xpath::parse(&self.prefix)
                .map_err(|err| format!("subscription {:?}: invalid prefix: {err}", self.name))?;
        }

        if self.mode == Mode::Stream
            && self.stream_mode == StreamMode::Sample
            && !self.sample_interval.is_some_and(|interval| interval > Duration::ZERO)
        {
            return Err(format!(
                "subscription {:?}: sample-interval is required in sample mode",
                self.name
            )
            .into());
        }

        if self.mode != Mode::Stream && self.stream_mode != StreamMode::default() {
            return Err(format!(
                "subscription {:?}: stream-mode is only valid with mode=stream",
                self.name
            )
            .into());
        }

        Ok(())
    }

    /// Builds the initial wire request for this subscription.
    pub fn subscribe_request(&self, default_encoding: Encoding) -> crate::Result<SubscribeRequest> {
        let mut prefix = if self.prefix.is_empty() {
            Default::default()
        } else {
            xpath::parse(&self.prefix)?
        };
        if !self.target.is_empty() {
            prefix.target = self.target.clone();
        }

        let mode = match self.mode {
            Mode::Stream => subscription_list::Mode::Stream,
            Mode::Once => subscription_list::Mode::Once,
            Mode::Poll => subscription_list::Mode::Poll,
        };

        let stream_mode = match self.stream_mode {
            StreamMode::TargetDefined => SubscriptionMode::TargetDefined,
            StreamMode::OnChange => SubscriptionMode::OnChange,
            StreamMode::Sample => SubscriptionMode::Sample,
        };

        let subscription = self
            .paths
            .iter()
            .map(|path| {
                let path = xpath::parse(path)?;
                Ok(Subscription {
                    path: Some(path),
                    mode: stream_mode as i32,
                    sample_interval: self
                        .sample_interval
                        .map(|interval| interval.as_nanos() as u64)
                        .unwrap_or_default(),
                    suppress_redundant: self.suppress_redundant,
                    heartbeat_interval: self
                        .heartbeat_interval
                        .map(|interval| interval.as_nanos() as u64)
                        .unwrap_or_default(),
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;

        let list = SubscriptionList {
            prefix: Some(prefix),
            subscription,
            qos: self.qos.map(|marking| QosMarking { marking }),
            mode: mode as i32,
            use_models: self
                .models
                .iter()
                .map(|name| crate::proto::gnmi::ModelData {
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
            encoding: self.encoding.unwrap_or(default_encoding).to_proto() as i32,
            updates_only: self.updates_only,
            ..Default::default()
        };

        Ok(SubscribeRequest {
            request: Some(subscribe_request::Request::Subscribe(list)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_subscription() -> SubscriptionConfig {
        SubscriptionConfig {
            name: "ports".into(),
            prefix: "/interfaces".into(),
            paths: vec!["interface[name=eth0]/state/counters".into()],
            mode: Mode::Stream,
            stream_mode: StreamMode::Sample,
            sample_interval: Some(Duration::from_secs(10)),
            ..Default::default()
        }
    }

    #[test]
    fn sample_mode_requires_interval() {
        let mut sub = sample_subscription();
        assert!(sub.validate().is_ok());

        sub.sample_interval = None;
        assert!(sub.validate().is_err());

        sub.sample_interval = Some(Duration::ZERO);
        assert!(sub.validate().is_err());
    }

    #[test]
    fn stream_mode_only_with_stream() {
        let mut sub = sample_subscription();
        sub.mode = Mode::Once;
        assert!(sub.validate().is_err());

        sub.stream_mode = StreamMode::TargetDefined;
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn builds_request() {
        let sub = sample_subscription();
        let request = sub.subscribe_request(Encoding::Json).unwrap();

        let Some(subscribe_request::Request::Subscribe(list)) = request.request else {
            panic!("expected a subscribe request");
        };

        assert_eq!(list.mode, subscription_list::Mode::Stream as i32);
        assert_eq!(list.encoding, crate::proto::gnmi::Encoding::Json as i32);
        assert_eq!(list.subscription.len(), 1);

        let subscription = &list.subscription[0];
        assert_eq!(subscription.mode, SubscriptionMode::Sample as i32);
        assert_eq!(subscription.sample_interval, 10_000_000_000);
        assert_eq!(
            subscription.path.as_ref().unwrap().elem[0].name,
            "interface"
        );

        assert_eq!(list.prefix.as_ref().unwrap().elem[0].name, "interfaces");
    }

    #[test]
    fn target_selector_lands_in_prefix() {
        let mut sub = sample_subscription();
        sub.target = "leaf1".into();

        let request = sub.subscribe_request(Encoding::Json).unwrap();
        let Some(subscribe_request::Request::Subscribe(list)) = request.request else {
            panic!("expected a subscribe request");
        };
        assert_eq!(list.prefix.unwrap().target, "leaf1");
    }

    #[test]
    fn deserializes_kebab_case() {
        let sub: SubscriptionConfig = serde_yaml::from_str(
            r#"
paths:
  - /interfaces/interface/state/counters
mode: stream
stream-mode: sample
sample-interval: 10s
encoding: json_ietf
"#,
        )
        .unwrap();

        assert_eq!(sub.mode, Mode::Stream);
        assert_eq!(sub.stream_mode, StreamMode::Sample);
        assert_eq!(sub.sample_interval, Some(Duration::from_secs(10)));
        assert_eq!(sub.encoding, Some(Encoding::JsonIetf));
    }
}
