//! Per-output event processor chains.
//!
//! Processor kinds live in a registry keyed by the single top-level key of
//! each named definition; configs compile their regexes and conditions once
//! at build time and a failure there is fatal at startup.

mod actions;
mod drop;
mod merge;
mod override_ts;
mod strings;
mod trigger;

pub use actions::{Action, ActionConfig, ActionContext, HttpActionConfig, SharedAction};
pub use drop::DropConfig;
pub use merge::MergeConfig;
pub use override_ts::OverrideTsConfig;
pub use strings::StringsConfig;
pub use trigger::TriggerConfig;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::event::EventMsg;

/// A compiled event transformer. `apply` may shrink, grow or reorder the
/// batch but must not carry event references across calls.
#[async_trait]
pub trait Processor: Send {
    async fn apply(&mut self, events: Vec<EventMsg>) -> Vec<EventMsg>;
}

/// What processor construction can see: the built actions, by name.
#[derive(Clone, Default)]
pub struct ProcessorContext {
    pub actions: IndexMap<String, SharedAction>,
}

/// Registry of processor kinds. The kind is the single top-level key of
/// the config mapping, e.g. `drop: {...}`.
#[typetag::serde]
pub trait ProcessorConfig: Debug + Send + Sync {
    fn build(&self, cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>>;
}

/// An ordered, already-built chain for one output.
pub struct Pipeline {
    processors: Vec<Box<dyn Processor>>,
}

impl Pipeline {
    pub fn empty() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub async fn apply(&mut self, mut events: Vec<EventMsg>) -> Vec<EventMsg> {
        for processor in &mut self.processors {
            events = processor.apply(events).await;
            if events.is_empty() {
                break;
            }
        }

        events
    }
}

/// Resolve `names` against the named definitions and build the chain.
/// Unknown names are configuration errors.
pub fn make_processors(
    names: &[String],
    definitions: &IndexMap<String, Box<dyn ProcessorConfig>>,
    cx: &ProcessorContext,
) -> crate::Result<Pipeline> {
    let mut processors = Vec::with_capacity(names.len());

    for name in names {
        let Some(config) = definitions.get(name) else {
            return Err(format!("event processor {name:?} not found").into());
        };

        let processor = config
            .build(cx)
            .map_err(|err| format!("failed initializing event processor {name:?}: {err}"))?;
        processors.push(processor);

        debug!(message = "added event processor to output", processor = %name);
    }

    Ok(Pipeline { processors })
}

/// Build the shared action set from config.
pub fn make_actions(
    definitions: &IndexMap<String, Box<dyn ActionConfig>>,
) -> crate::Result<IndexMap<String, SharedAction>> {
    let mut actions = IndexMap::new();

    for (name, config) in definitions {
        let action: SharedAction = Arc::from(
            config
                .build(name)
                .map_err(|err| format!("failed initializing action {name:?}: {err}"))?,
        );
        actions.insert(name.clone(), action);
    }

    Ok(actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;

    fn definitions(raw: &str) -> IndexMap<String, Box<dyn ProcessorConfig>> {
        serde_yaml::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn chain_applies_in_order() {
        let definitions = definitions(
            r#"
merge-all:
  merge:
    always: true
drop-empty:
  drop:
    condition: ".values.count eq 0"
"#,
        );

        let names = vec!["merge-all".to_string(), "drop-empty".to_string()];
        let mut pipeline =
            make_processors(&names, &definitions, &ProcessorContext::default()).unwrap();

        let mut one = EventMsg::new("s", 1);
        one.values.insert("count".into(), Value::Int(0));
        let mut two = EventMsg::new("s", 2);
        two.values.insert("count".into(), Value::Int(5));

        // merged into one event with count=5 (second wins), so drop-empty
        // passes it through
        let out = pipeline.apply(vec![one.clone(), two]).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values["count"], Value::Int(5));

        // a single zero-count event is dropped
        let out = pipeline.apply(vec![one]).await;
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_processor_name_is_fatal() {
        let definitions = definitions("noop:\n  merge: {}\n");
        let names = vec!["missing".to_string()];

        assert!(make_processors(&names, &definitions, &ProcessorContext::default()).is_err());
    }
}
