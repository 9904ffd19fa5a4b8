//! A pull-model scrape cache over the live event stream.
//!
//! Events are flattened into untyped series identified by a 64-bit
//! fingerprint; a later observation replaces an earlier one only when its
//! timestamp is strictly greater, and entries expire on a sliding window.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Output, OutputConfig, OutputContext};
use crate::event::{self, Event, Meta};
use crate::processors::{self, EventProcessor};
use crate::proto::gnmi::SubscribeResponse;

const DEFAULT_LISTEN: &str = ":9804";
const DEFAULT_PATH: &str = "/metrics";
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60);
const DEFAULT_METRIC_HELP: &str = "gnmic generated metric";
const EVENT_BUFFER: usize = 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(5);

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_expiration() -> Duration {
    DEFAULT_EXPIRATION
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PrometheusOutputConfig {
    /// Scrape listen address, `:9804` by default.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Scrape path.
    #[serde(default = "default_path")]
    pub path: String,

    /// Entries older than this are evicted.
    #[serde(default = "default_expiration", with = "humantime_serde")]
    pub expiration: Duration,

    /// Static prefix for every metric name.
    #[serde(default)]
    pub metric_prefix: String,

    /// Include the subscription name in metric names.
    #[serde(default = "default_true")]
    pub append_subscription_name: bool,

    /// Processors applied to events before they are stored.
    #[serde(default)]
    pub event_processors: Vec<String>,
}

impl Default for PrometheusOutputConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            expiration: DEFAULT_EXPIRATION,
            metric_prefix: String::new(),
            append_subscription_name: true,
            event_processors: Vec::new(),
        }
    }
}

#[async_trait]
#[typetag::serde(name = "prometheus")]
impl OutputConfig for PrometheusOutputConfig {
    async fn build(&self, cx: OutputContext) -> crate::Result<Arc<dyn Output>> {
        let chain = processors::build_chain(&self.event_processors, &cx.processors, &cx.processor_cx)?;

        let registry = Arc::new(Registry::new(self));

        let listener = crate::http::bind(&self.listen).await?;
        let token = cx.token.child_token();

        let render = {
            let registry = Arc::clone(&registry);
            Arc::new(move || registry.render())
        };
        let server = crate::http::serve_text(listener, token.clone(), self.path.clone(), render);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let worker = tokio::spawn(worker(rx, Arc::clone(&registry), chain, token.clone()));

        info!(
            message = "initialized prometheus output",
            listen = %self.listen,
            path = %self.path,
        );

        Ok(Arc::new(PrometheusOutput {
            tx,
            token,
            tasks: tokio::sync::Mutex::new(vec![server, worker]),
        }))
    }
}

struct PrometheusOutput {
    tx: mpsc::Sender<Event>,
    token: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl Output for PrometheusOutput {
    async fn write(&self, rsp: &SubscribeResponse, meta: &Meta) {
        for event in event::response_to_events(rsp, meta) {
            tokio::select! {
                _ = self.token.cancelled() => return,
                result = self.tx.send(event) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn close(&self) {
        self.token.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!(message = "prometheus output did not shut down in time");
            }
        }
        info!(message = "closed prometheus output");
    }
}

async fn worker(
    mut rx: mpsc::Receiver<Event>,
    registry: Arc<Registry>,
    mut chain: Vec<Box<dyn EventProcessor>>,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            }
        };

        for event in processors::apply_chain(&mut chain, vec![event]) {
            registry.store(&event, now_nanos());
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    name: String,
    /// Sorted by label name.
    labels: Vec<(String, String)>,
    value: f64,
    /// Event time in unix nanos; drives both last-write-wins and expiry.
    timestamp: i64,
}

struct Registry {
    entries: Mutex<HashMap<u64, Entry>>,
    expiration: Duration,
    metric_prefix: String,
    append_subscription_name: bool,
}

impl Registry {
    fn new(config: &PrometheusOutputConfig) -> Self {
        Registry {
            entries: Mutex::new(HashMap::new()),
            expiration: config.expiration,
            metric_prefix: config.metric_prefix.clone(),
            append_subscription_name: config.append_subscription_name,
        }
    }

    fn store(&self, event: &Event, now: i64) {
        let labels = labels_for(event);

        let mut entries = self.entries.lock().expect("entries lock poisoned");
        for (leaf, value) in &event.values {
            let Some(value) = value.as_f64() else {
                continue;
            };

            let entry = Entry {
                name: self.metric_name(&event.name, leaf),
                labels: labels.clone(),
                value,
                timestamp: event.timestamp,
            };

            let key = fingerprint(&entry.name, &entry.labels);
            match entries.get(&key) {
                Some(existing) if existing.timestamp >= entry.timestamp => {}
                _ => {
                    entries.insert(key, entry);
                }
            }
        }

        let expiry = now - self.expiration.as_nanos() as i64;
        entries.retain(|_, entry| entry.timestamp >= expiry);
    }

    /// Renders the text exposition format for a scrape.
    fn render(&self) -> String {
        let entries = self.entries.lock().expect("entries lock poisoned");
        let expiry = now_nanos() - self.expiration.as_nanos() as i64;

        let mut live: Vec<&Entry> = entries
            .values()
            .filter(|entry| entry.timestamp >= expiry)
            .collect();
        live.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));

        let mut out = String::new();
        let mut last_name = "";
        for entry in live {
            if entry.name != last_name {
                let _ = writeln!(out, "# HELP {} {DEFAULT_METRIC_HELP}", entry.name);
                let _ = writeln!(out, "# TYPE {} untyped", entry.name);
                last_name = &entry.name;
            }

            out.push_str(&entry.name);
            if !entry.labels.is_empty() {
                out.push('{');
                for (index, (name, value)) in entry.labels.iter().enumerate() {
                    if index > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{name}=\"{}\"", escape_label_value(value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {} {}", entry.value, entry.timestamp / 1_000_000);
        }

        out
    }

    /// `prefix_subscription_leaf`, each part sanitized, empty parts elided.
    fn metric_name(&self, subscription: &str, leaf: &str) -> String {
        let mut out = String::new();

        let prefix = sanitize(&self.metric_prefix);
        if !prefix.is_empty() {
            out.push_str(&prefix);
            out.push('_');
        }

        if self.append_subscription_name {
            out.push_str(sanitize(subscription).trim_end_matches('_'));
            out.push('_');
        }

        out.push_str(sanitize(leaf).trim_start_matches('_'));
        out
    }
}

/// Replaces every run of `[^a-zA-Z0-9_]` with a single underscore.
fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Tag keys become label names via their basename, first occurrence wins.
fn labels_for(event: &Event) -> Vec<(String, String)> {
    let mut labels: Vec<(String, String)> = Vec::with_capacity(event.tags.len());
    for (key, value) in &event.tags {
        let name = sanitize(key.rsplit('/').next().unwrap_or(key));
        if labels.iter().any(|(existing, _)| *existing == name) {
            continue;
        }
        labels.push((name, value.clone()));
    }
    labels.sort();
    labels
}

/// FNV-1a over `name || 0x00 || (label ":" value ":")*` with labels sorted
/// by name. Sorting is what makes the fingerprint independent of label
/// order.
fn fingerprint(name: &str, sorted_labels: &[(String, String)]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let mut write = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(PRIME);
        }
    };

    write(name.as_bytes());
    write(&[0]);
    for (label, value) in sorted_labels {
        write(label.as_bytes());
        write(b":");
        write(value.as_bytes());
        write(b":");
    }

    hash
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::value::Value;

    fn registry(expiration: Duration) -> Registry {
        Registry::new(&PrometheusOutputConfig {
            expiration,
            ..Default::default()
        })
    }

    fn event(name: &str, tags: &[(&str, &str)], values: &[(&str, i64)], timestamp: i64) -> Event {
        Event {
            name: name.to_string(),
            timestamp,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Int(*v)))
                .collect::<BTreeMap<_, _>>(),
            deletes: Vec::new(),
        }
    }

    #[test]
    fn sanitize_runs() {
        assert_eq!(sanitize("in-octets"), "in_octets");
        assert_eq!(sanitize("/a/b--c"), "_a_b_c");
        assert_eq!(sanitize("already_fine_1"), "already_fine_1");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn metric_names() {
        let mut registry = registry(DEFAULT_EXPIRATION);
        assert_eq!(registry.metric_name("sub", "/p/q"), "sub_p_q");

        registry.metric_prefix = "gnmic".into();
        assert_eq!(registry.metric_name("sub", "/p/q"), "gnmic_sub_p_q");

        registry.append_subscription_name = false;
        assert_eq!(registry.metric_name("sub", "/p/q"), "gnmic_p_q");
    }

    #[test]
    fn default_config_includes_subscription_name() {
        // the config a user gets from a bare `type: prometheus` entry
        let config: PrometheusOutputConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.append_subscription_name);
        assert_eq!(config.listen, DEFAULT_LISTEN);
        assert_eq!(config.path, DEFAULT_PATH);
        assert_eq!(config.expiration, DEFAULT_EXPIRATION);

        let registry = Registry::new(&config);
        let now = now_nanos();
        registry.store(
            &event("sub", &[("interface", "eth0")], &[("/p/q", 9)], now),
            now,
        );

        let rendered = registry.render();
        assert!(
            rendered.contains("sub_p_q{interface=\"eth0\"} 9"),
            "unexpected scrape: {rendered}"
        );
    }

    #[test]
    fn fingerprint_is_label_order_independent() {
        let forward = vec![
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        // labels_for always sorts; the fingerprint relies on it
        let mut reversed: Vec<_> = forward.iter().cloned().rev().collect();
        reversed.sort();

        assert_eq!(fingerprint("m", &forward), fingerprint("m", &reversed));
    }

    #[test]
    fn fingerprint_separation() {
        let mut seen = std::collections::HashSet::new();
        for index in 0..10_000 {
            let entry = match index % 4 {
                0 => fingerprint(&format!("metric_{index}"), &[]),
                1 => fingerprint(
                    "metric",
                    &[(format!("label_{index}"), "value".to_string())],
                ),
                2 => fingerprint(
                    "metric",
                    &[("label".to_string(), format!("value_{index}"))],
                ),
                _ => fingerprint(
                    &format!("metric_{index}"),
                    &[("label".to_string(), format!("value_{index}"))],
                ),
            };
            assert!(seen.insert(entry), "fingerprint collision at {index}");
        }
    }

    #[test]
    fn last_write_wins_on_newer_timestamp() {
        let registry = registry(Duration::from_secs(3600));
        let now = now_nanos();

        registry.store(&event("sub", &[("interface", "eth0")], &[("/p/q", 7)], now), now);
        registry.store(
            &event("sub", &[("interface", "eth0")], &[("/p/q", 9)], now + 1),
            now + 1,
        );

        let rendered = registry.render();
        assert!(
            rendered.contains("sub_p_q{interface=\"eth0\"} 9"),
            "unexpected scrape: {rendered}"
        );
    }

    #[test]
    fn earlier_timestamp_does_not_replace() {
        let registry = registry(Duration::from_secs(3600));
        let now = now_nanos();

        registry.store(&event("sub", &[("interface", "eth0")], &[("/p/q", 7)], now), now);
        registry.store(
            &event("sub", &[("interface", "eth0")], &[("/p/q", 9)], now - 1),
            now,
        );

        let rendered = registry.render();
        assert!(
            rendered.contains("sub_p_q{interface=\"eth0\"} 7"),
            "unexpected scrape: {rendered}"
        );
    }

    #[test]
    fn expired_entries_are_evicted() {
        let registry = registry(Duration::from_secs(60));
        let now = now_nanos();
        let stale = now - Duration::from_secs(120).as_nanos() as i64;

        registry.store(&event("sub", &[], &[("/old", 1)], stale), now);
        assert!(!registry.render().contains("sub_old"));

        // a stale entry is also swept when a fresh write happens
        registry.store(&event("sub", &[], &[("/old", 1)], stale), stale);
        registry.store(&event("sub", &[], &[("/new", 2)], now), now);
        let entries = registry.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn non_numeric_values_are_skipped() {
        let registry = registry(Duration::from_secs(3600));
        let now = now_nanos();

        let mut ev = event("sub", &[], &[], now);
        ev.values
            .insert("/status".to_string(), Value::String("UP".into()));
        ev.values.insert("/speed".to_string(), Value::Uint(1000));

        registry.store(&ev, now);
        let rendered = registry.render();
        assert!(rendered.contains("sub_speed"));
        assert!(!rendered.contains("sub_status"));
    }

    #[test]
    fn label_names_use_basenames_first_wins() {
        let ev = event(
            "sub",
            &[
                ("/interfaces/interface/name", "eth0"),
                ("name", "eth0"),
                ("source", "leaf1"),
            ],
            &[("/p", 1)],
            1,
        );

        let labels = labels_for(&ev);
        assert_eq!(
            labels,
            vec![
                ("name".to_string(), "eth0".to_string()),
                ("source".to_string(), "leaf1".to_string()),
            ]
        );
    }

    #[test]
    fn scrape_timestamp_is_milliseconds() {
        let registry = registry(Duration::from_secs(3600));
        let now = now_nanos();

        registry.store(&event("sub", &[], &[("/p", 1)], now), now);
        let rendered = registry.render();
        let line = rendered.lines().last().unwrap();
        assert!(
            line.ends_with(&format!(" {}", now / 1_000_000)),
            "unexpected line: {line}"
        );
    }
}
