//! Logging initialization.

use std::path::Path;

use tracing_subscriber::filter::EnvFilter;

/// Initializes the global subscriber. Levels come from `GNMIC_LOG` when
/// set, otherwise from the `--debug`/`--log` flags; output goes to the log
/// file when one is configured, to stderr otherwise.
pub fn init(debug: bool, log: bool, log_file: Option<&Path>) -> crate::Result<()> {
    let default_level = if debug {
        "gnmic=debug"
    } else if log {
        "gnmic=info"
    } else {
        "gnmic=warn"
    };

    let filter = EnvFilter::try_from_env("GNMIC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| format!("error opening log file {path:?}: {err}"))?;
            builder.with_writer(file).with_ansi(false).init();
        }
        None => {
            builder.with_writer(std::io::stderr).init();
        }
    }

    Ok(())
}
