//! `gnmic capabilities`

use std::collections::BTreeMap;
use std::sync::Arc;

use argh::FromArgs;
use tokio_util::sync::CancellationToken;
use tracing::error;

use gnmic::collector::{Collector, CollectorConfig};
use gnmic::config::AppConfig;
use gnmic::proto::gnmi::Encoding;

use super::{exit_code_for, print_prefix, RootCommand, RPC_ERROR, SUCCESS};

/// query target capabilities
#[derive(FromArgs)]
#[argh(subcommand, name = "capabilities")]
pub struct CapabilitiesCommand {
    /// only print the gNMI version
    #[argh(switch)]
    pub version: bool,
}

impl CapabilitiesCommand {
    pub async fn run(&self, root: &RootCommand, mut config: AppConfig) -> i32 {
        if let Err(err) = config.normalize() {
            error!(message = "configuration error", %err);
            return super::CONFIG_ERROR;
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
            // failures were logged during init; they are transport errors
            RPC_ERROR
        };

        for name in initialized {
            match collector.capabilities(&name).await {
                Ok(response) => {
                    let prefix = print_prefix(&config, root.no_prefix, &name);
                    println!("{prefix}gNMI version: {}", response.g_nmi_version);
                    if self.version {
                        continue;
                    }

                    println!("{prefix}supported models:");
                    for model in &response.supported_models {
                        println!(
                            "{prefix}  - {}, {}, {}",
                            model.name, model.organization, model.version
                        );
                    }
                    println!("{prefix}supported encodings:");
                    for encoding in &response.supported_encodings {
                        let name = Encoding::try_from(*encoding)
                            .map(|e| e.as_str_name())
                            .unwrap_or("UNKNOWN");
                        println!("{prefix}  - {name}");
                    }
                }
                Err(err) => {
                    error!(message = "capabilities request failed", target = %name, %err);
                    code = code.max(exit_code_for(&err));
                }
            }
        }

        code
    }
}
