use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Processor, ProcessorConfig, ProcessorContext};
use crate::event::EventMsg;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    S,
    Ms,
    Us,
    #[default]
    Ns,
}

/// Replaces every event timestamp with the local wall clock.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideTsConfig {
    #[serde(default)]
    pub precision: Precision,
}

#[typetag::serde(name = "override-ts")]
impl ProcessorConfig for OverrideTsConfig {
    fn build(&self, _cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>> {
        Ok(Box::new(OverrideTs {
            precision: self.precision,
        }))
    }
}

struct OverrideTs {
    precision: Precision,
}

#[async_trait]
impl Processor for OverrideTs {
    async fn apply(&mut self, mut events: Vec<EventMsg>) -> Vec<EventMsg> {
        for event in events.iter_mut() {
            let now = Utc::now();
            let nanos = now.timestamp_nanos_opt().unwrap_or_default();

            event.timestamp = match self.precision {
                Precision::S => now.timestamp(),
                Precision::Ms => nanos / 1_000_000,
                Precision::Us => nanos / 1_000,
                Precision::Ns => nanos,
            };
        }

        events
    }
}
