//! The argh command tree and the flag-over-config merge.

pub mod capabilities;
pub mod get;
pub mod path;
pub mod set;
pub mod subscribe;

use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;

use gnmic::config::{expand_home, AppConfig};

pub const SUCCESS: i32 = 0;
pub const CONFIG_ERROR: i32 = 1;
pub const RPC_ERROR: i32 = 2;
pub const INTERRUPTED: i32 = 130;

#[derive(FromArgs)]
#[argh(description = "gnmic is a gNMI client and multi-target telemetry collector")]
pub struct RootCommand {
    /// path to the configuration file (default: ~/gnmic.yml)
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    /// target address, `host[:port]`, repeatable
    #[argh(option, short = 'a')]
    pub address: Vec<String>,

    /// username
    #[argh(option, short = 'u')]
    pub username: Option<String>,

    /// password
    #[argh(option, short = 'p')]
    pub password: Option<String>,

    /// default port applied to addresses without one
    #[argh(option)]
    pub port: Option<u16>,

    /// wire encoding: json, bytes, proto, ascii, json_ietf
    #[argh(option, short = 'e')]
    pub encoding: Option<String>,

    /// output format: json, textproto, event, proto
    #[argh(option)]
    pub format: Option<String>,

    /// use a plaintext connection
    #[argh(switch)]
    pub insecure: bool,

    /// path to a CA certificate file
    #[argh(option)]
    pub tls_ca: Option<PathBuf>,

    /// path to a client certificate file
    #[argh(option)]
    pub tls_cert: Option<PathBuf>,

    /// path to a client key file
    #[argh(option)]
    pub tls_key: Option<PathBuf>,

    /// minimum TLS version: 1.2 or 1.3
    #[argh(option)]
    pub tls_min_version: Option<String>,

    /// maximum TLS version: 1.2 or 1.3
    #[argh(option)]
    pub tls_max_version: Option<String>,

    /// skip server certificate verification
    #[argh(switch)]
    pub skip_verify: bool,

    /// per-request and dial timeout, e.g. 30s
    #[argh(option)]
    pub timeout: Option<String>,

    /// enable debug logging
    #[argh(switch, short = 'd')]
    pub debug: bool,

    /// log to stderr
    #[argh(switch)]
    pub log: bool,

    /// write logs to this file
    #[argh(option)]
    pub log_file: Option<PathBuf>,

    /// maximum gRPC message size in bytes
    #[argh(option)]
    pub max_msg_size: Option<usize>,

    /// internal metrics listen address
    #[argh(option)]
    pub prometheus_address: Option<String>,

    /// stream reopen delay, e.g. 10s; 0 disables retries
    #[argh(option)]
    pub retry: Option<String>,

    /// response channel capacity per target
    #[argh(option)]
    pub target_buffer_size: Option<usize>,

    /// do not prefix output with the target address
    #[argh(switch)]
    pub no_prefix: bool,

    /// print the request along with the response
    #[argh(switch)]
    pub print_request: bool,

    /// print the version and exit
    #[argh(switch, short = 'v')]
    pub version: bool,

    #[argh(subcommand)]
    pub sub_command: Option<Commands>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum Commands {
    Capabilities(capabilities::CapabilitiesCommand),
    Get(get::GetCommand),
    Set(set::SetCommand),
    Subscribe(subscribe::SubscribeCommand),
    Path(path::PathCommand),
}

impl RootCommand {
    /// Loads the config file and layers the flags on top, giving flags the
    /// highest precedence.
    pub fn load_config(&self) -> gnmic::Result<AppConfig> {
        let mut config = AppConfig::load(self.config.as_deref())?;

        if !self.address.is_empty() {
            config.address.clone_from(&self.address);
            // explicit addresses replace file-configured targets
            config.targets.clear();
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let Some(encoding) = &self.encoding {
            config.encoding = encoding.parse()?;
        }
        if let Some(format) = &self.format {
            config.format = format.parse()?;
        }
        if self.insecure {
            config.insecure = true;
        }
        if let Some(ca) = &self.tls_ca {
            config.tls_ca = Some(expand_home(&ca.to_string_lossy()));
        }
        if let Some(cert) = &self.tls_cert {
            config.tls_cert = Some(expand_home(&cert.to_string_lossy()));
        }
        if let Some(key) = &self.tls_key {
            config.tls_key = Some(expand_home(&key.to_string_lossy()));
        }
        if let Some(version) = &self.tls_min_version {
            config.tls_min_version = Some(version.clone());
        }
        if let Some(version) = &self.tls_max_version {
            config.tls_max_version = Some(version.clone());
        }
        if self.skip_verify {
            config.skip_verify = true;
        }
        if let Some(timeout) = &self.timeout {
            config.timeout = Some(parse_duration_flag("timeout", timeout)?);
        }
        if self.debug {
            config.debug = true;
        }
        if self.log {
            config.log = true;
        }
        if let Some(log_file) = &self.log_file {
            config.log_file = Some(expand_home(&log_file.to_string_lossy()));
        }
        if let Some(size) = self.max_msg_size {
            config.max_msg_size = Some(size);
        }
        if let Some(address) = &self.prometheus_address {
            config.prometheus_address = Some(address.clone());
        }
        if let Some(retry) = &self.retry {
            config.retry = Some(parse_duration_flag("retry", retry)?);
        }
        if let Some(size) = self.target_buffer_size {
            config.target_buffer_size = Some(size);
        }

        Ok(config)
    }
}

fn parse_duration_flag(name: &str, value: &str) -> gnmic::Result<Duration> {
    humantime::parse_duration(value).map_err(|err| format!("invalid --{name}: {err}").into())
}

/// `[address] ` when output from several targets is interleaved.
pub fn print_prefix(config: &AppConfig, no_prefix: bool, target: &str) -> String {
    if config.targets.len() > 1 && !no_prefix {
        format!("[{target}] ")
    } else {
        String::new()
    }
}

/// Maps an error chain to the process exit code: transport and RPC errors
/// exit 2, everything else is an argument/config error.
pub fn exit_code_for(err: &gnmic::Error) -> i32 {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err.as_ref());
    while let Some(current) = source {
        if current.is::<tonic::Status>()
            || current.is::<tonic::transport::Error>()
            || current.is::<gnmic::target::ConnectError>()
        {
            return RPC_ERROR;
        }
        source = current.source();
    }

    CONFIG_ERROR
}
