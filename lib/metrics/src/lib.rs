#![forbid(unsafe_code)]

mod attributes;
mod counter;
mod encoding;
mod gauge;
mod metric;
mod registry;

pub use attributes::Attributes;
pub use counter::Counter;
pub use encoding::encode_text;
pub use gauge::Gauge;
pub use metric::{Metric, Observation};
pub use registry::{global_registry, register_counter, register_gauge, Registry, Reporter};
