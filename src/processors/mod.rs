//! Event processors: pure transforms applied between decode and dispatch.

mod trigger;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::event::Event;

/// Shared read-only context handed to processors at build time.
#[derive(Clone, Debug, Default)]
pub struct ProcessorContext {
    /// Target name to address, for processors that key behavior off the
    /// fleet layout.
    pub targets: Arc<BTreeMap<String, String>>,
}

pub trait EventProcessor: Debug + Send {
    /// Transforms a batch of events. Processors that drop events return a
    /// shorter vec.
    fn apply(&mut self, events: Vec<Event>) -> Vec<Event>;
}

/// Configuration side of a processor, deserialized from the `processors`
/// table by its `type` tag.
#[typetag::serde(tag = "type")]
pub trait ProcessorConfig: Debug + Send + Sync {
    fn build(&self, cx: &ProcessorContext) -> crate::Result<Box<dyn EventProcessor>>;
}

/// Instantiates the named processors, in the order given.
pub fn build_chain(
    names: &[String],
    registry: &BTreeMap<String, Box<dyn ProcessorConfig>>,
    cx: &ProcessorContext,
) -> crate::Result<Vec<Box<dyn EventProcessor>>> {
    let mut chain = Vec::with_capacity(names.len());
    for name in names {
        let config = registry
            .get(name)
            .ok_or_else(|| format!("unknown processor {name:?}"))?;
        chain.push(config.build(cx)?);
    }
    Ok(chain)
}

pub fn apply_chain(chain: &mut [Box<dyn EventProcessor>], mut events: Vec<Event>) -> Vec<Event> {
    for processor in chain {
        if events.is_empty() {
            break;
        }
        events = processor.apply(events);
    }
    events
}

pub use trigger::TriggerConfig;
