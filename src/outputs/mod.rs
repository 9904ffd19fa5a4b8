//! Outputs: named destinations for subscribe responses.

mod file;
mod prometheus;
mod stdout;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::event::Meta;
use crate::format::Format;
use crate::processors::{ProcessorConfig, ProcessorContext};
use crate::proto::gnmi::SubscribeResponse;

/// Context handed to outputs at build time.
#[derive(Clone)]
pub struct OutputContext {
    /// Parent cancellation token; outputs derive their own children.
    pub token: CancellationToken,

    /// Process-wide serialization format for text-oriented outputs.
    pub format: Format,

    /// Processor definitions an output may instantiate for its own chain.
    pub processors: Arc<BTreeMap<String, Box<dyn ProcessorConfig>>>,

    pub processor_cx: ProcessorContext,
}

impl OutputContext {
    #[cfg(test)]
    pub fn new_test() -> Self {
        Self {
            token: CancellationToken::new(),
            format: Format::default(),
            processors: Arc::new(BTreeMap::new()),
            processor_cx: ProcessorContext::default(),
        }
    }
}

/// A live sink. Writes must not fail upward; a sink logs its own errors and
/// applies its own buffering and drop policy.
#[async_trait]
pub trait Output: Send + Sync {
    async fn write(&self, rsp: &SubscribeResponse, meta: &Meta);

    async fn close(&self);
}

/// Configuration side of an output, deserialized from the `outputs` table by
/// its `type` tag.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait OutputConfig: Debug + Send + Sync {
    async fn build(&self, cx: OutputContext) -> crate::Result<Arc<dyn Output>>;
}

pub use file::FileOutputConfig;
pub use prometheus::PrometheusOutputConfig;
pub use stdout::StdoutOutputConfig;
