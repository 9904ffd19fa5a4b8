//! Actions: detached side effects fired by the trigger processor.

mod http;
mod log;

use std::fmt::Debug;

use async_trait::async_trait;

use crate::event::Event;

#[async_trait]
pub trait Action: Debug + Send + Sync {
    /// Runs the side effect for one event. The result is logged by the
    /// caller; errors never reach the event stream.
    async fn run(&self, event: &Event) -> crate::Result<serde_json::Value>;
}

#[typetag::serde(tag = "type")]
pub trait ActionConfig: Debug + Send + Sync {
    fn build(&self) -> crate::Result<Box<dyn Action>>;
}

pub use http::HttpActionConfig;
pub use log::LogActionConfig;
