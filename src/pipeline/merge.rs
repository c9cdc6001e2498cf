use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Processor, ProcessorConfig, ProcessorContext};
use crate::event::EventMsg;

/// Folds events together: all of them into the first when `always`,
/// otherwise grouped by identical timestamp.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    #[serde(default)]
    pub always: bool,
}

#[typetag::serde(name = "merge")]
impl ProcessorConfig for MergeConfig {
    fn build(&self, _cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>> {
        Ok(Box::new(Merge {
            always: self.always,
        }))
    }
}

struct Merge {
    always: bool,
}

/// Union of tags and values with the second event winning collisions,
/// concatenated deletes, max timestamp.
fn merge_into(first: &mut EventMsg, second: EventMsg) {
    for (key, value) in second.tags {
        first.tags.insert(key, value);
    }
    for (key, value) in second.values {
        first.values.insert(key, value);
    }
    first.deletes.extend(second.deletes);
    if second.timestamp > first.timestamp {
        first.timestamp = second.timestamp;
    }
}

#[async_trait]
impl Processor for Merge {
    async fn apply(&mut self, events: Vec<EventMsg>) -> Vec<EventMsg> {
        if events.is_empty() {
            return events;
        }

        if self.always {
            let mut iter = events.into_iter();
            let mut first = iter.next().expect("checked non-empty");
            for event in iter {
                merge_into(&mut first, event);
            }
            return vec![first];
        }

        let mut result: Vec<EventMsg> = Vec::new();
        let mut by_timestamp: HashMap<i64, usize> = HashMap::new();

        for event in events {
            match by_timestamp.get(&event.timestamp) {
                Some(&index) => merge_into(&mut result[index], event),
                None => {
                    by_timestamp.insert(event.timestamp, result.len());
                    result.push(event);
                }
            }
        }

        result
    }
}
