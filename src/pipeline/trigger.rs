use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::{Action, ActionContext, Processor, ProcessorConfig, ProcessorContext, SharedAction};
use crate::event::EventMsg;

/// Fires a list of actions when the condition holds often enough: the
/// occurrence count inside the sliding window must land in
/// `[min-occurrences, max-occurrences]`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default = "default_occurrences")]
    pub min_occurrences: usize,

    #[serde(default = "default_occurrences")]
    pub max_occurrences: usize,

    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,

    /// Shared state handed to every action of a firing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Value>,

    /// Fire without blocking the pipeline.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

const fn default_occurrences() -> usize {
    1
}

const fn default_window() -> Duration {
    Duration::from_secs(60)
}

#[typetag::serde(name = "trigger")]
impl ProcessorConfig for TriggerConfig {
    fn build(&self, cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>> {
        if self.max_occurrences < self.min_occurrences {
            return Err("max-occurrences cannot be lower than min-occurrences".into());
        }

        let condition = match &self.condition {
            Some(raw) => Some(condition::parse(raw)?),
            None => None,
        };

        let mut actions = Vec::with_capacity(self.actions.len());
        for name in &self.actions {
            let action = cx
                .actions
                .get(name)
                .ok_or_else(|| format!("failed to initialize action {name:?}: config not found"))?;
            actions.push(action.clone());
        }

        Ok(Box::new(Trigger {
            condition,
            min_occurrences: self.min_occurrences.max(1),
            max_occurrences: self.max_occurrences.max(1),
            window: self.window,
            actions,
            vars: self.vars.clone().unwrap_or(Value::Null),
            run_async: self.run_async,
            occurrences: Vec::new(),
            last_trigger: None,
        }))
    }
}

struct Trigger {
    condition: Option<condition::Expression>,
    min_occurrences: usize,
    max_occurrences: usize,
    window: Duration,
    actions: Vec<SharedAction>,
    vars: Value,
    run_async: bool,

    occurrences: Vec<Instant>,
    last_trigger: Option<Instant>,
}

impl Trigger {
    /// Record an occurrence at `now` and decide whether to fire. The window
    /// keeps at most `max + 1` entries so a saturated window can re-fire
    /// once a full window has passed since the last firing.
    fn occurred(&mut self, now: Instant) -> bool {
        self.occurrences.retain(|at| *at + self.window > now);
        self.occurrences.push(now);

        let mut count = self.occurrences.len();
        if count > self.max_occurrences {
            self.occurrences
                .drain(..count - self.max_occurrences - 1);
            count = self.occurrences.len();
        }

        if count >= self.min_occurrences && count <= self.max_occurrences {
            self.last_trigger = Some(now);
            return true;
        }

        if count > self.min_occurrences {
            let expired = match self.last_trigger {
                Some(last) => last + self.window < now,
                None => true,
            };
            if expired {
                self.last_trigger = Some(now);
                return true;
            }
        }

        false
    }

    async fn fire(&self, event: &EventMsg) {
        run_actions(&self.actions, event, &self.vars).await;
    }
}

async fn run_actions(actions: &[SharedAction], event: &EventMsg, vars: &Value) {
    let mut env = Map::new();

    for action in actions {
        let cx = ActionContext {
            input: event,
            env: &env,
            vars,
        };

        match action.run(cx).await {
            Ok(output) => {
                debug!(message = "action done", action = %action.name());
                env.insert(action.name().to_string(), output);
            }
            Err(err) => {
                warn!(message = "trigger action failed", action = %action.name(), %err);
                return;
            }
        }
    }
}

#[async_trait]
impl Processor for Trigger {
    async fn apply(&mut self, events: Vec<EventMsg>) -> Vec<EventMsg> {
        let now = Instant::now();

        for event in &events {
            if let Some(condition) = &self.condition {
                if !condition.eval(&event.to_json()) {
                    continue;
                }
            }

            if !self.occurred(now) {
                continue;
            }

            if self.run_async {
                let actions = self.actions.clone();
                let event = event.clone();
                let vars = self.vars.clone();
                tokio::spawn(async move {
                    run_actions(&actions, &event, &vars).await;
                });
            } else {
                self.fire(event).await;
            }
        }

        events
    }
}
