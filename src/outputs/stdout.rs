use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Output, OutputConfig, OutputContext};
use crate::event::Meta;
use crate::format::{self, Format};
use crate::proto::gnmi::SubscribeResponse;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StdoutOutputConfig {
    /// Overrides the process-wide format for this output.
    pub format: Option<Format>,
}

#[async_trait]
#[typetag::serde(name = "stdout")]
impl OutputConfig for StdoutOutputConfig {
    async fn build(&self, cx: OutputContext) -> crate::Result<Arc<dyn Output>> {
        Ok(Arc::new(StdoutOutput {
            format: self.format.unwrap_or(cx.format),
        }))
    }
}

struct StdoutOutput {
    format: Format,
}

#[async_trait]
impl Output for StdoutOutput {
    async fn write(&self, rsp: &SubscribeResponse, meta: &Meta) {
        let encoded = match format::format_response(self.format, rsp, meta) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return,
            Err(err) => {
                warn!(message = "failed to format message", %err);
                return;
            }
        };

        let mut stdout = std::io::stdout().lock();
        // without the newline the last line stays buffered in a terminal
        if let Err(err) = stdout
            .write_all(&encoded)
            .and_then(|()| stdout.write_all(b"\n"))
        {
            error!(message = "write to stdout failed", %err);
        }
    }

    async fn close(&self) {}
}
