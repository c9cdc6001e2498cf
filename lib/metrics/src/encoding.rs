use std::fmt::Write;

use crate::attributes::Attributes;
use crate::metric::Observation;
use crate::registry::{Registry, Reporter};

/// Render every metric in the registry in the Prometheus text exposition
/// format.
pub fn encode_text(registry: &Registry) -> String {
    let mut reporter = TextReporter {
        out: String::new(),
        name: "",
    };

    registry.report(&mut reporter);
    reporter.out
}

struct TextReporter {
    out: String,
    name: &'static str,
}

fn write_attrs(out: &mut String, attrs: &Attributes) {
    if attrs.is_empty() {
        return;
    }

    out.push('{');
    for (i, (key, value)) in attrs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }

        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        let _ = write!(out, "{}=\"{}\"", key, escaped);
    }
    out.push('}');
}

impl Reporter for TextReporter {
    fn start_metric(&mut self, name: &'static str, description: &'static str, kind: &'static str) {
        let _ = writeln!(self.out, "# HELP {} {}", name, description);
        let _ = writeln!(self.out, "# TYPE {} {}", name, kind);
        self.name = name;
    }

    fn report(&mut self, attrs: &Attributes, observation: Observation) {
        self.out.push_str(self.name);
        write_attrs(&mut self.out, attrs);

        match observation {
            Observation::Counter(v) | Observation::Gauge(v) => {
                let _ = writeln!(self.out, " {}", v);
            }
        }
    }

    fn finish_metric(&mut self) {
        self.name = "";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format() {
        let registry = Registry::new();

        registry
            .register_counter("subscribe_responses_total", "Responses received.")
            .recorder([("target", "leaf1".to_string())])
            .inc(3);
        registry
            .register_gauge("locked_targets", "Targets currently locked.")
            .recorder(&[])
            .set(2);

        let out = encode_text(&registry);

        assert!(out.contains("# HELP subscribe_responses_total Responses received."));
        assert!(out.contains("# TYPE subscribe_responses_total counter"));
        assert!(out.contains("subscribe_responses_total{target=\"leaf1\"} 3"));
        assert!(out.contains("locked_targets 2"));
    }
}
