use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{Output, OutputConfig, OutputContext};
use crate::event::Meta;
use crate::format::{self, Format};
use crate::proto::gnmi::SubscribeResponse;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileOutputConfig {
    /// File to append messages to, created when missing.
    pub filename: PathBuf,

    /// Overrides the process-wide format for this output.
    pub format: Option<Format>,
}

#[async_trait]
#[typetag::serde(name = "file")]
impl OutputConfig for FileOutputConfig {
    async fn build(&self, cx: OutputContext) -> crate::Result<Arc<dyn Output>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.filename)
            .await
            .map_err(|err| format!("failed to open {:?}: {err}", self.filename))?;

        Ok(Arc::new(FileOutput {
            file: Mutex::new(file),
            format: self.format.unwrap_or(cx.format),
        }))
    }
}

struct FileOutput {
    file: Mutex<File>,
    format: Format,
}

#[async_trait]
impl Output for FileOutput {
    async fn write(&self, rsp: &SubscribeResponse, meta: &Meta) {
        let mut encoded = match format::format_response(self.format, rsp, meta) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return,
            Err(err) => {
                warn!(message = "failed to format message", %err);
                return;
            }
        };
        encoded.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(err) = file.write_all(&encoded).await {
            error!(message = "write to file failed", %err);
        }
    }

    async fn close(&self) {
        let mut file = self.file.lock().await;
        if let Err(err) = file.flush().await {
            error!(message = "flush file failed", %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::gnmi::{subscribe_response::Response, Notification};

    #[tokio::test]
    async fn appends_one_line_per_message() {
        let dir = tempfile::tempdir().unwrap();
        let filename = dir.path().join("out.json");

        let config = FileOutputConfig {
            filename: filename.clone(),
            format: None,
        };
        let output = config.build(OutputContext::new_test()).await.unwrap();

        let rsp = SubscribeResponse {
            response: Some(Response::Update(Notification {
                timestamp: 1,
                ..Default::default()
            })),
        };
        let meta = Meta {
            source: "leaf1".into(),
            subscription_name: "sub".into(),
            system_name: None,
        };

        output.write(&rsp, &meta).await;
        output.write(&rsp, &meta).await;
        output.close().await;

        let content = std::fs::read_to_string(&filename).unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["source"], "leaf1");
    }
}
