//! Process configuration: YAML file, `GNMIC_*` environment overrides and
//! CLI flags, merged in that order of increasing precedence.

pub mod clustering;
pub mod subscriptions;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::outputs::OutputConfig;
use crate::processors::ProcessorConfig;
use crate::target::TargetConfig;
use crate::tls::TlsConfig;
use clustering::ClusteringConfig;
use subscriptions::SubscriptionConfig;

pub const ENV_PREFIX: &str = "GNMIC_";

const DEFAULT_RETRY: Duration = Duration::from_secs(10);

/// Wire encoding requested from targets.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Json,
    Bytes,
    Proto,
    Ascii,
    JsonIetf,
}

impl Encoding {
    pub fn to_proto(self) -> crate::proto::gnmi::Encoding {
        use crate::proto::gnmi::Encoding as Wire;
        match self {
            Encoding::Json => Wire::Json,
            Encoding::Bytes => Wire::Bytes,
            Encoding::Proto => Wire::Proto,
            Encoding::Ascii => Wire::Ascii,
            Encoding::JsonIetf => Wire::JsonIetf,
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Encoding::Json),
            "bytes" => Ok(Encoding::Bytes),
            "proto" => Ok(Encoding::Proto),
            "ascii" => Ok(Encoding::Ascii),
            "json_ietf" => Ok(Encoding::JsonIetf),
            other => Err(format!(
                "unknown encoding {other:?}, must be one of: json, bytes, proto, ascii, json_ietf"
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    #[serde(default)]
    pub address: Vec<String>,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Default port applied to addresses without one.
    pub port: Option<u16>,

    #[serde(default)]
    pub encoding: Encoding,

    #[serde(default)]
    pub insecure: bool,

    pub tls_ca: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub tls_min_version: Option<String>,
    pub tls_max_version: Option<String>,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub format: crate::format::Format,

    /// Log to stderr even without a log file.
    #[serde(default)]
    pub log: bool,

    pub log_file: Option<PathBuf>,

    pub max_msg_size: Option<usize>,

    /// Internal metrics listen address.
    pub prometheus_address: Option<String>,

    #[serde(default, with = "humantime_serde")]
    pub retry: Option<Duration>,

    pub target_buffer_size: Option<usize>,

    #[serde(default)]
    pub targets: BTreeMap<String, TargetConfig>,

    #[serde(default)]
    pub subscriptions: BTreeMap<String, SubscriptionConfig>,

    #[serde(default)]
    pub outputs: BTreeMap<String, Box<dyn OutputConfig>>,

    #[serde(default)]
    pub processors: BTreeMap<String, Box<dyn ProcessorConfig>>,

    pub clustering: Option<ClusteringConfig>,

    /// Anything this version does not recognize; reported at debug level.
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            address: Vec::new(),
            username: None,
            password: None,
            port: None,
            encoding: Encoding::default(),
            insecure: false,
            tls_ca: None,
            tls_cert: None,
            tls_key: None,
            tls_min_version: None,
            tls_max_version: None,
            skip_verify: false,
            timeout: None,
            debug: false,
            format: crate::format::Format::default(),
            log: false,
            log_file: None,
            max_msg_size: None,
            prometheus_address: None,
            retry: None,
            target_buffer_size: None,
            targets: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            outputs: BTreeMap::new(),
            processors: BTreeMap::new(),
            clustering: None,
            unknown: BTreeMap::new(),
        }
    }
}

impl AppConfig {
    /// Loads the config file (explicit path, or `~/gnmic.yml` when present)
    /// and applies environment overrides.
    pub fn load(file: Option<&Path>) -> crate::Result<AppConfig> {
        let mut config = match resolve_config_file(file)? {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|err| format!("failed to read config file {path:?}: {err}"))?;
                serde_yaml::from_str(&raw)
                    .map_err(|err| format!("failed to parse config file {path:?}: {err}"))?
            }
            None => AppConfig::default(),
        };

        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Applies `GNMIC_<UPPER_SNAKE>` overrides for scalar settings.
    pub fn apply_env(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> crate::Result<()> {
        for (key, value) in vars {
            let Some(key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            let key = key.to_lowercase().replace('_', "-");
            match key.as_str() {
                "address" => {
                    self.address = value.split(',').map(|s| s.trim().to_string()).collect();
                }
                "username" => self.username = Some(value),
                "password" => self.password = Some(value),
                "port" => self.port = Some(parse_env("port", &value)?),
                "encoding" => self.encoding = value.parse()?,
                "insecure" => self.insecure = parse_env("insecure", &value)?,
                "tls-ca" => self.tls_ca = Some(expand_home(&value)),
                "tls-cert" => self.tls_cert = Some(expand_home(&value)),
                "tls-key" => self.tls_key = Some(expand_home(&value)),
                "tls-min-version" => self.tls_min_version = Some(value),
                "tls-max-version" => self.tls_max_version = Some(value),
                "skip-verify" => self.skip_verify = parse_env("skip-verify", &value)?,
                "timeout" => self.timeout = Some(parse_duration_env("timeout", &value)?),
                "debug" => self.debug = parse_env("debug", &value)?,
                "format" => self.format = value.parse()?,
                "log" => self.log = parse_env("log", &value)?,
                "log-file" => self.log_file = Some(expand_home(&value)),
                "max-msg-size" => self.max_msg_size = Some(parse_env("max-msg-size", &value)?),
                "prometheus-address" => self.prometheus_address = Some(value),
                "retry" => self.retry = Some(parse_duration_env("retry", &value)?),
                "target-buffer-size" => {
                    self.target_buffer_size = Some(parse_env("target-buffer-size", &value)?);
                }
                _ => debug!(message = "unhandled environment override", key = %key),
            }
        }
        Ok(())
    }

    /// The global TLS material, used by targets that configure none.
    pub fn tls(&self) -> Option<TlsConfig> {
        if self.tls_ca.is_none()
            && self.tls_cert.is_none()
            && self.tls_key.is_none()
            && self.tls_min_version.is_none()
            && self.tls_max_version.is_none()
            && !self.skip_verify
        {
            return None;
        }

        Some(TlsConfig {
            ca: self.tls_ca.clone().map(|p| expand_home_path(&p)),
            cert: self.tls_cert.clone().map(|p| expand_home_path(&p)),
            key: self.tls_key.clone().map(|p| expand_home_path(&p)),
            min_version: self.tls_min_version.clone(),
            max_version: self.tls_max_version.clone(),
            skip_verify: self.skip_verify,
        })
    }

    /// Fills in derived state after all layers are merged: names from map
    /// keys, per-target fallbacks from the globals, targets synthesized
    /// from bare addresses, and validation.
    pub fn normalize(&mut self) -> crate::Result<()> {
        for (name, subscription) in self.subscriptions.iter_mut() {
            subscription.name.clone_from(name);
            subscription.validate()?;
        }

        if self.targets.is_empty() {
            for address in &self.address {
                let address = apply_port(address, self.port);
                self.targets.insert(
                    address.clone(),
                    TargetConfig {
                        name: address.clone(),
                        address,
                        ..Default::default()
                    },
                );
            }
        }

        if self.targets.is_empty() {
            return Err("no targets or addresses configured".into());
        }

        let tls = self.tls();
        for (name, target) in self.targets.iter_mut() {
            target.name.clone_from(name);
            if target.address.is_empty() {
                target.address.clone_from(name);
            }
            target.address = apply_port(&target.address, self.port);

            if target.username.is_none() {
                target.username.clone_from(&self.username);
            }
            if target.password.is_none() {
                target.password.clone_from(&self.password);
            }
            if !target.insecure {
                target.insecure = self.insecure;
            }
            if target.tls.is_none() {
                target.tls.clone_from(&tls);
            }
            if target.timeout.is_none() {
                target.timeout = self.timeout;
            }
            if target.retry.is_none() {
                target.retry = Some(self.retry.unwrap_or(DEFAULT_RETRY));
            }
            if target.buffer_size.is_none() {
                target.buffer_size = self.target_buffer_size;
            }
            if target.max_msg_size.is_none() {
                target.max_msg_size = self.max_msg_size;
            }
        }

        for key in self.unknown.keys() {
            debug!(message = "unknown configuration key", key = %key);
        }

        Ok(())
    }
}

fn resolve_config_file(file: Option<&Path>) -> crate::Result<Option<PathBuf>> {
    if let Some(file) = file {
        let file = expand_home_path(file);
        if !file.exists() {
            return Err(format!("config file {file:?} does not exist").into());
        }
        return Ok(Some(file));
    }

    for candidate in ["~/gnmic.yml", "~/gnmic.yaml"] {
        let path = expand_home(candidate);
        if path.exists() {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

fn parse_env<T>(key: &str, value: &str) -> crate::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|err| format!("invalid {ENV_PREFIX}{key}: {err}").into())
}

fn parse_duration_env(key: &str, value: &str) -> crate::Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|err| format!("invalid {ENV_PREFIX}{key}: {err}").into())
}

fn apply_port(address: &str, port: Option<u16>) -> String {
    let Some(port) = port else {
        return address.to_string();
    };

    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{port}")
    }
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn expand_home_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => expand_home(s),
        None => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
username: admin
password: admin
port: 6030
encoding: json_ietf
retry: 5s
targets:
  leaf1:
    address: 10.0.0.1
  leaf2:
    address: 10.0.0.2:57400
    username: other
    subscriptions: [ports]
subscriptions:
  ports:
    paths:
      - /interfaces/interface/state/counters
    mode: stream
    stream-mode: sample
    sample-interval: 10s
outputs:
  out:
    type: stdout
processors:
  alarm:
    type: event-trigger
    condition: "values.x > 10"
    action:
      type: log
unexpected-key: whatever
"#;

    #[test]
    fn loads_and_normalizes() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.normalize().unwrap();

        assert_eq!(config.encoding, Encoding::JsonIetf);

        let leaf1 = &config.targets["leaf1"];
        assert_eq!(leaf1.name, "leaf1");
        assert_eq!(leaf1.address, "10.0.0.1:6030");
        assert_eq!(leaf1.username.as_deref(), Some("admin"));
        assert_eq!(leaf1.retry, Some(Duration::from_secs(5)));

        let leaf2 = &config.targets["leaf2"];
        assert_eq!(leaf2.address, "10.0.0.2:57400");
        assert_eq!(leaf2.username.as_deref(), Some("other"));
        assert_eq!(leaf2.subscriptions, vec!["ports".to_string()]);

        assert_eq!(config.subscriptions["ports"].name, "ports");
        assert!(config.outputs.contains_key("out"));
        assert!(config.processors.contains_key("alarm"));
        assert!(config.unknown.contains_key("unexpected-key"));
    }

    #[test]
    fn env_overrides() {
        let mut config = AppConfig::default();
        config
            .apply_env(
                vec![
                    ("GNMIC_USERNAME".to_string(), "fromenv".to_string()),
                    ("GNMIC_PORT".to_string(), "6030".to_string()),
                    ("GNMIC_INSECURE".to_string(), "true".to_string()),
                    ("GNMIC_TIMEOUT".to_string(), "45s".to_string()),
                    ("GNMIC_ENCODING".to_string(), "json_ietf".to_string()),
                    ("UNRELATED".to_string(), "ignored".to_string()),
                ]
                .into_iter(),
            )
            .unwrap();

        assert_eq!(config.username.as_deref(), Some("fromenv"));
        assert_eq!(config.port, Some(6030));
        assert!(config.insecure);
        assert_eq!(config.timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.encoding, Encoding::JsonIetf);
    }

    #[test]
    fn invalid_env_is_an_error() {
        let mut config = AppConfig::default();
        let result = config.apply_env(
            vec![("GNMIC_PORT".to_string(), "not-a-port".to_string())].into_iter(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn addresses_become_targets() {
        let mut config = AppConfig {
            address: vec!["10.0.0.1".to_string(), "10.0.0.2:6030".to_string()],
            ..Default::default()
        };
        config.normalize().unwrap();

        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets["10.0.0.1"].address, "10.0.0.1");
        assert_eq!(config.targets["10.0.0.2:6030"].address, "10.0.0.2:6030");
    }

    #[test]
    fn no_targets_is_an_error() {
        let mut config = AppConfig::default();
        assert!(config.normalize().is_err());
    }

    #[test]
    fn global_tls_only_when_configured() {
        let config = AppConfig::default();
        assert!(config.tls().is_none());

        let config = AppConfig {
            skip_verify: true,
            ..Default::default()
        };
        let tls = config.tls().unwrap();
        assert!(tls.skip_verify);
    }

    #[test]
    fn home_expansion() {
        std::env::set_var("HOME", "/home/test");
        assert_eq!(
            expand_home("~/certs/ca.pem"),
            PathBuf::from("/home/test/certs/ca.pem")
        );
        assert_eq!(expand_home("/abs/path"), PathBuf::from("/abs/path"));
    }
}
