use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Action, ActionConfig};
use crate::event::Event;

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogActionConfig {
    /// Static prefix included in every log line.
    #[serde(default)]
    prefix: String,
}

#[typetag::serde(name = "log")]
impl ActionConfig for LogActionConfig {
    fn build(&self) -> crate::Result<Box<dyn Action>> {
        Ok(Box::new(LogAction {
            prefix: self.prefix.clone(),
        }))
    }
}

#[derive(Debug)]
struct LogAction {
    prefix: String,
}

#[async_trait]
impl Action for LogAction {
    async fn run(&self, event: &Event) -> crate::Result<serde_json::Value> {
        let body = serde_json::to_value(event)?;
        if self.prefix.is_empty() {
            info!(message = "event trigger", event = %body);
        } else {
            info!(message = "event trigger", prefix = %self.prefix, event = %body);
        }
        Ok(body)
    }
}
