//! Triggers an action when a condition holds often enough within a window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{EventProcessor, ProcessorConfig, ProcessorContext};
use crate::actions::{Action, ActionConfig};
use crate::condition::Condition;
use crate::event::Event;

const DEFAULT_CONDITION: &str = "true";
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

fn default_condition() -> String {
    DEFAULT_CONDITION.to_string()
}

fn default_max_occurrences() -> usize {
    1
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TriggerConfig {
    /// Boolean expression evaluated against each event.
    #[serde(default = "default_condition")]
    condition: String,

    /// Number of matches within the window required to fire.
    #[serde(default = "default_max_occurrences")]
    max_occurrences: usize,

    /// Sliding window over match instants. Defaults to one minute when
    /// `max-occurrences` is greater than one.
    #[serde(default, with = "humantime_serde")]
    window: Option<Duration>,

    /// The action to run when the trigger fires.
    action: Box<dyn ActionConfig>,
}

#[typetag::serde(name = "event-trigger")]
impl ProcessorConfig for TriggerConfig {
    fn build(&self, _cx: &ProcessorContext) -> crate::Result<Box<dyn EventProcessor>> {
        let condition: Condition = self.condition.parse()?;
        let max_occurrences = self.max_occurrences.max(1);
        let window = match self.window {
            Some(window) if window > Duration::ZERO => window,
            _ => DEFAULT_WINDOW,
        };
        let action: Arc<dyn Action> = Arc::from(self.action.build()?);

        Ok(Box::new(Trigger {
            condition,
            max_occurrences,
            window,
            occurrences: VecDeque::new(),
            action,
        }))
    }
}

#[derive(Debug)]
struct Trigger {
    condition: Condition,
    max_occurrences: usize,
    window: Duration,
    occurrences: VecDeque<Instant>,
    action: Arc<dyn Action>,
}

impl EventProcessor for Trigger {
    fn apply(&mut self, events: Vec<Event>) -> Vec<Event> {
        let now = Instant::now();
        for event in &events {
            self.observe(now, event);
        }
        events
    }
}

impl Trigger {
    fn observe(&mut self, now: Instant, event: &Event) {
        if !self.condition.eval(event) {
            return;
        }

        if self.max_occurrences == 1 {
            self.fire(event);
            return;
        }

        self.occurrences.push_back(now);
        let horizon = now.checked_sub(self.window).unwrap_or(now);
        while let Some(first) = self.occurrences.front() {
            if *first < horizon {
                self.occurrences.pop_front();
            } else {
                break;
            }
        }

        if self.occurrences.len() >= self.max_occurrences {
            self.fire(event);
            self.occurrences.clear();
        }
    }

    fn fire(&self, event: &Event) {
        let action = Arc::clone(&self.action);
        let event = event.clone();
        tokio::spawn(async move {
            match action.run(&event).await {
                Ok(result) => debug!(message = "action done", %result),
                Err(err) => warn!(message = "action failed", %err),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct CountingAction(AtomicUsize);

    #[async_trait]
    impl Action for CountingAction {
        async fn run(&self, _event: &Event) -> crate::Result<serde_json::Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }

    fn trigger(condition: &str, max_occurrences: usize, window: Duration) -> (Trigger, Arc<CountingAction>) {
        let action = Arc::new(CountingAction::default());
        let trigger = Trigger {
            condition: condition.parse().unwrap(),
            max_occurrences,
            window,
            occurrences: VecDeque::new(),
            action: action.clone(),
        };
        (trigger, action)
    }

    fn event_with_value(value: i64) -> Event {
        Event {
            name: "sub".into(),
            values: [("x".to_string(), crate::value::Value::Int(value))]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_max_occurrences_in_window() {
        let (mut trigger, action) = trigger("values.x > 10", 3, Duration::from_secs(10));

        let start = Instant::now();
        for (offset, value) in [(0, 5), (1, 12), (2, 12)] {
            trigger.observe(start + Duration::from_secs(offset), &event_with_value(value));
        }
        tokio::task::yield_now().await;
        assert_eq!(action.0.load(Ordering::SeqCst), 0);

        trigger.observe(start + Duration::from_secs(3), &event_with_value(12));
        tokio::task::yield_now().await;
        assert_eq!(action.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn old_occurrences_age_out() {
        let (mut trigger, action) = trigger("true", 2, Duration::from_secs(5));

        let start = Instant::now();
        trigger.observe(start, &event_with_value(1));
        // far enough apart that the first occurrence has left the window
        trigger.observe(start + Duration::from_secs(30), &event_with_value(1));
        tokio::task::yield_now().await;
        assert_eq!(action.0.load(Ordering::SeqCst), 0);

        trigger.observe(start + Duration::from_secs(31), &event_with_value(1));
        tokio::task::yield_now().await;
        assert_eq!(action.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn single_occurrence_short_circuits() {
        let (mut trigger, action) = trigger("values.x > 10", 1, Duration::from_secs(10));

        trigger.observe(Instant::now(), &event_with_value(20));
        trigger.observe(Instant::now(), &event_with_value(5));
        tokio::task::yield_now().await;
        assert_eq!(action.0.load(Ordering::SeqCst), 1);
    }
}
