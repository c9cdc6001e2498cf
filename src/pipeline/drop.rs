use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Processor, ProcessorConfig, ProcessorContext};
use crate::event::EventMsg;

/// Drops an event when the condition holds, or when ANY of the regexes
/// matches a tag name, tag value, value name or string value.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct DropConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

fn compile(patterns: &[String]) -> crate::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(|err| err.to_string().into()))
        .collect()
}

#[typetag::serde(name = "drop")]
impl ProcessorConfig for DropConfig {
    fn build(&self, _cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>> {
        let condition = match &self.condition {
            Some(raw) => Some(condition::parse(raw)?),
            None => None,
        };

        Ok(Box::new(Drop {
            condition,
            tag_names: compile(&self.tag_names)?,
            tags: compile(&self.tags)?,
            value_names: compile(&self.value_names)?,
            values: compile(&self.values)?,
        }))
    }
}

struct Drop {
    condition: Option<condition::Expression>,
    tag_names: Vec<Regex>,
    tags: Vec<Regex>,
    value_names: Vec<Regex>,
    values: Vec<Regex>,
}

impl Drop {
    fn drop(&self, event: &EventMsg) -> bool {
        if let Some(condition) = &self.condition {
            return condition.eval(&event.to_json());
        }

        for (key, value) in &event.values {
            if self.value_names.iter().any(|re| re.is_match(key)) {
                return true;
            }

            if let Some(s) = value.as_str() {
                if self.values.iter().any(|re| re.is_match(s)) {
                    return true;
                }
            }
        }

        for (key, value) in &event.tags {
            if self.tag_names.iter().any(|re| re.is_match(key)) {
                return true;
            }
            if self.tags.iter().any(|re| re.is_match(value)) {
                return true;
            }
        }

        false
    }
}

#[async_trait]
impl Processor for Drop {
    async fn apply(&mut self, mut events: Vec<EventMsg>) -> Vec<EventMsg> {
        events.retain(|event| !self.drop(event));
        events
    }
}
