use async_trait::async_trait;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Processor, ProcessorConfig, ProcessorContext};
use crate::event::{EventMsg, Value};

/// String transformations applied to the names or values of tags and
/// values selected by regex. Transforms run in declaration order; the
/// kind is the single key of each list entry.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct StringsConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_names: Vec<String>,

    #[serde(default)]
    pub transforms: Vec<IndexMap<String, TransformSpec>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct TransformSpec {
    /// `name` or `value`.
    #[serde(default)]
    pub apply_on: ApplyOn,

    /// Keep the original entry when the name changes.
    #[serde(default)]
    pub keep: bool,

    // replace
    #[serde(default)]
    pub old: String,
    #[serde(default)]
    pub new: String,

    // trim-prefix / trim-suffix
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,

    // split
    #[serde(default)]
    pub split_on: String,
    #[serde(default)]
    pub join_with: String,
    #[serde(default)]
    pub ignore_first: usize,
    #[serde(default)]
    pub ignore_last: usize,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyOn {
    #[default]
    Name,
    Value,
}

enum Op {
    Replace(Regex),
    TrimPrefix,
    TrimSuffix,
    Title,
    ToLower,
    ToUpper,
    Split,
    PathBase,
}

struct Transform {
    op: Op,
    spec: TransformSpec,
}

impl Transform {
    fn compile(kind: &str, spec: &TransformSpec) -> crate::Result<Self> {
        let op = match kind {
            "replace" => Op::Replace(Regex::new(&spec.old).map_err(|err| err.to_string())?),
            "trim-prefix" => Op::TrimPrefix,
            "trim-suffix" => Op::TrimSuffix,
            "title" => Op::Title,
            "to-lower" => Op::ToLower,
            "to-upper" => Op::ToUpper,
            "split" => Op::Split,
            "path-base" => Op::PathBase,
            other => return Err(format!("unknown string transform {other:?}").into()),
        };

        Ok(Self {
            op,
            spec: spec.clone(),
        })
    }

    fn transform(&self, s: &str) -> String {
        match &self.op {
            Op::Replace(re) => re.replace_all(s, self.spec.new.as_str()).into_owned(),
            Op::TrimPrefix => s
                .strip_prefix(self.spec.prefix.as_str())
                .unwrap_or(s)
                .to_string(),
            Op::TrimSuffix => s
                .strip_suffix(self.spec.suffix.as_str())
                .unwrap_or(s)
                .to_string(),
            Op::Title => title_case(s),
            Op::ToLower => s.to_lowercase(),
            Op::ToUpper => s.to_uppercase(),
            Op::Split => {
                let items: Vec<&str> = s.split(self.spec.split_on.as_str()).collect();
                let count = items.len();
                let first = self.spec.ignore_first;
                let last = self.spec.ignore_last;
                if count <= first || count <= last || first >= count - last {
                    return String::new();
                }
                items[first..count - last].join(self.spec.join_with.as_str())
            }
            Op::PathBase => path_base(s),
        }
    }

    /// Apply to a (key, value) pair, on the side `apply-on` selects.
    fn apply(&self, key: &str, value: &Value) -> (String, Value) {
        match self.spec.apply_on {
            ApplyOn::Name => (self.transform(key), value.clone()),
            ApplyOn::Value => match value.as_str() {
                Some(s) => (key.to_string(), Value::String(self.transform(s))),
                None => (key.to_string(), value.clone()),
            },
        }
    }
}

/// The last path element as `filepath.Base` defines it: trailing slashes
/// dropped first, `.` for an empty input, `/` when nothing else is left.
fn path_base(s: &str) -> String {
    if s.is_empty() {
        return ".".to_string();
    }

    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }

    trimmed.rsplit('/').next().unwrap_or(trimmed).to_string()
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;

    for ch in s.chars() {
        if ch.is_whitespace() {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            at_word_start = false;
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
    }

    out
}

fn compile(patterns: &[String]) -> crate::Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| Regex::new(pattern).map_err(|err| err.to_string().into()))
        .collect()
}

#[typetag::serde(name = "strings")]
impl ProcessorConfig for StringsConfig {
    fn build(&self, _cx: &ProcessorContext) -> crate::Result<Box<dyn Processor>> {
        let mut transforms = Vec::new();
        for entry in &self.transforms {
            for (kind, spec) in entry {
                transforms.push(Transform::compile(kind, spec)?);
            }
        }

        Ok(Box::new(Strings {
            tags: compile(&self.tags)?,
            tag_names: compile(&self.tag_names)?,
            values: compile(&self.values)?,
            value_names: compile(&self.value_names)?,
            transforms,
        }))
    }
}

struct Strings {
    tags: Vec<Regex>,
    tag_names: Vec<Regex>,
    values: Vec<Regex>,
    value_names: Vec<Regex>,
    transforms: Vec<Transform>,
}

impl Strings {
    /// Run the whole chain against one pair, starting from the snapshot
    /// the caller took. Overlapping selectors re-run the chain from that
    /// same snapshot, once per match.
    fn transform_value(&self, event: &mut EventMsg, key: &str, value: Value) {
        let mut key = key.to_string();
        let mut value = value;

        for transform in &self.transforms {
            if !transform.spec.keep {
                event.values.shift_remove(&key);
            }

            let (new_key, new_value) = transform.apply(&key, &value);
            key = new_key;
            value = new_value;
            event.values.insert(key.clone(), value.clone());
        }
    }

    fn transform_tag(&self, event: &mut EventMsg, key: &str, value: &str) {
        let mut key = key.to_string();
        let mut value = Value::String(value.to_string());

        for transform in &self.transforms {
            if !transform.spec.keep {
                event.tags.shift_remove(&key);
            }

            let (new_key, new_value) = transform.apply(&key, &value);
            key = new_key;
            value = new_value;
            event.tags.insert(key.clone(), value.to_string());
        }
    }
}

#[async_trait]
impl Processor for Strings {
    async fn apply(&mut self, mut events: Vec<EventMsg>) -> Vec<EventMsg> {
        for event in events.iter_mut() {
            // the entry lists are snapshotted up front: the chain runs once
            // per matching selector per entry, and keys a chain inserts are
            // not picked up again within this apply
            let values: Vec<(String, Value)> = event
                .values
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            for (key, value) in &values {
                for re in &self.value_names {
                    if re.is_match(key) {
                        self.transform_value(event, key, value.clone());
                    }
                }

                if let Some(s) = value.as_str() {
                    for re in &self.values {
                        if re.is_match(s) {
                            self.transform_value(event, key, value.clone());
                        }
                    }
                }
            }

            let tags: Vec<(String, String)> = event
                .tags
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            for (key, value) in &tags {
                for re in &self.tag_names {
                    if re.is_match(key) {
                        self.transform_tag(event, key, value);
                    }
                }

                for re in &self.tags {
                    if re.is_match(value) {
                        self.transform_tag(event, key, value);
                    }
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(raw: &str) -> Box<dyn Processor> {
        let config: StringsConfig = serde_yaml::from_str(raw).unwrap();
        config.build(&ProcessorContext::default()).unwrap()
    }

    fn event_with_value(key: &str, value: Value) -> EventMsg {
        let mut event = EventMsg::new("s", 1);
        event.values.insert(key.to_string(), value);
        event
    }

    #[tokio::test]
    async fn replace_on_name() {
        let mut processor = build(
            r#"
value-names: ["-octets$"]
transforms:
  - replace:
      apply-on: name
      old: "-"
      new: "_"
"#,
        );

        let out = processor
            .apply(vec![event_with_value("in-octets", Value::Uint(1))])
            .await;
        assert!(out[0].values.contains_key("in_octets"));
        assert!(!out[0].values.contains_key("in-octets"));
    }

    #[tokio::test]
    async fn keep_retains_original() {
        let mut processor = build(
            r#"
value-names: ["-octets$"]
transforms:
  - replace:
      apply-on: name
      keep: true
      old: "-"
      new: "_"
"#,
        );

        let out = processor
            .apply(vec![event_with_value("in-octets", Value::Uint(1))])
            .await;
        assert!(out[0].values.contains_key("in_octets"));
        assert!(out[0].values.contains_key("in-octets"));
    }

    #[tokio::test]
    async fn trim_and_case_chain() {
        let mut processor = build(
            r#"
tag-names: ["^interface"]
transforms:
  - trim-prefix:
      apply-on: value
      prefix: "ethernet"
  - to-upper:
      apply-on: value
"#,
        );

        let mut event = EventMsg::new("s", 1);
        event
            .tags
            .insert("interface".to_string(), "ethernet1/1".to_string());

        let out = processor.apply(vec![event]).await;
        assert_eq!(out[0].tags["interface"], "1/1");
    }

    #[tokio::test]
    async fn split_ignores_edges() {
        let mut processor = build(
            r#"
value-names: ["^/"]
transforms:
  - split:
      apply-on: name
      split-on: "/"
      join-with: "_"
      ignore-first: 2
"#,
        );

        let out = processor
            .apply(vec![event_with_value(
                "/interfaces/interface/state/counters",
                Value::Uint(1),
            )])
            .await;

        // leading empty segment and "interfaces" ignored
        assert!(out[0].values.contains_key("interface_state_counters"));
    }

    #[tokio::test]
    async fn path_base_takes_the_last_element() {
        let mut processor = build(
            r#"
value-names: ["^/"]
transforms:
  - path-base:
      apply-on: name
"#,
        );

        let out = processor
            .apply(vec![event_with_value(
                "/interfaces/interface/state/oper-status",
                Value::String("UP".into()),
            )])
            .await;
        assert!(out[0].values.contains_key("oper-status"));
    }

    #[test]
    fn path_base_edges() {
        assert_eq!(path_base("/a/b"), "b");
        assert_eq!(path_base("a/b"), "b");
        // trailing slashes are dropped before taking the last element
        assert_eq!(path_base("/a/b/"), "b");
        assert_eq!(path_base("b"), "b");
        assert_eq!(path_base(""), ".");
        assert_eq!(path_base("/"), "/");
        assert_eq!(path_base("///"), "/");
    }

    #[tokio::test]
    async fn value_string_selector() {
        let mut processor = build(
            r#"
values: ["^up$"]
transforms:
  - to-upper:
      apply-on: value
"#,
        );

        let out = processor
            .apply(vec![event_with_value(
                "oper-state",
                Value::String("up".into()),
            )])
            .await;
        assert_eq!(out[0].values["oper-state"], Value::String("UP".into()));
    }

    #[tokio::test]
    async fn overlapping_selectors_rerun_from_the_snapshot() {
        // both name patterns match the same key, so the chain runs twice,
        // each run starting from the entry as the batch carried it; the
        // runs converge on one renamed entry instead of stacking
        let mut processor = build(
            r#"
value-names: ["^in-", "octets$"]
transforms:
  - trim-prefix:
      apply-on: name
      prefix: "in-"
"#,
        );

        let out = processor
            .apply(vec![event_with_value("in-octets", Value::Uint(1))])
            .await;
        assert_eq!(out[0].values.len(), 1);
        assert!(out[0].values.contains_key("octets"));
    }

    #[tokio::test]
    async fn name_and_value_matches_each_apply() {
        // matched by a name pattern and by a value pattern: two chain
        // runs from the same snapshot, one surviving entry
        let mut processor = build(
            r#"
value-names: ["^oper-"]
values: ["^up$"]
transforms:
  - to-upper:
      apply-on: value
"#,
        );

        let out = processor
            .apply(vec![event_with_value(
                "oper-state",
                Value::String("up".into()),
            )])
            .await;
        assert_eq!(out[0].values.len(), 1);
        assert_eq!(out[0].values["oper-state"], Value::String("UP".into()));
    }

    #[tokio::test]
    async fn transformed_keys_do_not_cascade() {
        // the chain renames "octets" to "octtetts", which still matches
        // the selector; the snapshot keeps it from being transformed again
        // within the same apply
        let mut processor = build(
            r#"
value-names: ["ts$"]
transforms:
  - replace:
      apply-on: name
      old: "t"
      new: "tt"
"#,
        );

        let out = processor
            .apply(vec![event_with_value("octets", Value::Uint(1))])
            .await;
        assert_eq!(out[0].values.len(), 1);
        assert!(out[0].values.contains_key("octtetts"));
    }

    #[test]
    fn title_case_words() {
        assert_eq!(title_case("oper state"), "Oper State");
        assert_eq!(title_case("UP"), "Up");
    }

    #[test]
    fn unknown_transform_is_fatal() {
        let config: StringsConfig = serde_yaml::from_str(
            r#"
transforms:
  - frobnicate: {}
"#,
        )
        .unwrap();
        assert!(config.build(&ProcessorContext::default()).is_err());
    }
}
