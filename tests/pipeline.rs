//! Literal pipeline scenarios straight from operational configs.

use gnmic::event::{EventMsg, Value};
use gnmic::pipeline::{make_processors, ProcessorConfig, ProcessorContext};
use indexmap::IndexMap;

fn definitions(raw: &str) -> IndexMap<String, Box<dyn ProcessorConfig>> {
    serde_yaml::from_str(raw).expect("processor definitions parse")
}

fn chain(raw: &str, names: &[&str]) -> gnmic::pipeline::Pipeline {
    let definitions = definitions(raw);
    let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    make_processors(&names, &definitions, &ProcessorContext::default())
        .expect("processors build")
}

#[tokio::test]
async fn drop_by_tag_name_empties_the_batch() {
    let mut pipeline = chain(
        r#"
drop-interfaces:
  drop:
    tag-names: ["^interface$"]
"#,
        &["drop-interfaces"],
    );

    let mut event = EventMsg::new("port-stats", 1);
    event
        .tags
        .insert("interface".to_string(), "ethernet1/1".to_string());
    event.values.insert("counter".to_string(), Value::Int(5));

    let out = pipeline.apply(vec![event]).await;
    assert!(out.is_empty());
}

#[tokio::test]
async fn merge_by_timestamp_scenario() {
    let mut pipeline = chain(
        r#"
merge-ts:
  merge: {}
"#,
        &["merge-ts"],
    );

    let mut first = EventMsg::new("s", 1);
    first.tags.insert("a".to_string(), "1".to_string());
    let mut second = EventMsg::new("s", 1);
    second.values.insert("v".to_string(), Value::Int(2));
    let mut third = EventMsg::new("s", 2);
    third.tags.insert("b".to_string(), "3".to_string());

    let out = pipeline.apply(vec![first, second, third]).await;

    assert_eq!(out.len(), 2);
    assert_eq!(out[0].timestamp, 1);
    assert_eq!(out[0].tags["a"], "1");
    assert_eq!(out[0].values["v"], Value::Int(2));
    assert_eq!(out[1].timestamp, 2);
    assert_eq!(out[1].tags["b"], "3");
}

#[tokio::test]
async fn drop_is_idempotent() {
    let raw = r#"
drop-noise:
  drop:
    tags: ["^noise"]
"#;

    let mut event_keep = EventMsg::new("s", 1);
    event_keep
        .tags
        .insert("class".to_string(), "signal".to_string());
    let mut event_drop = EventMsg::new("s", 2);
    event_drop
        .tags
        .insert("class".to_string(), "noise-floor".to_string());
    event_drop
        .tags
        .insert("noise".to_string(), "noise-floor".to_string());

    let batch = vec![event_keep.clone(), event_drop];

    let mut pipeline = chain(raw, &["drop-noise"]);
    let once = pipeline.apply(batch.clone()).await;
    let twice = pipeline.apply(once.clone()).await;

    assert_eq!(once, twice);
    assert_eq!(once, vec![event_keep]);
}

#[tokio::test]
async fn order_is_preserved_through_a_chain() {
    let mut pipeline = chain(
        r#"
rename:
  strings:
    value-names: ["-octets$"]
    transforms:
      - replace:
          apply-on: name
          old: "-"
          new: "_"
keep-counters:
  drop:
    condition: ".values.in_octets eq 0"
"#,
        &["rename", "keep-counters"],
    );

    let mut batch = Vec::new();
    for ts in 0..50 {
        let mut event = EventMsg::new("s", ts);
        event
            .values
            .insert("in-octets".to_string(), Value::Uint(ts as u64 + 1));
        batch.push(event);
    }

    let out = pipeline.apply(batch).await;
    let timestamps: Vec<i64> = out.iter().map(|event| event.timestamp).collect();
    assert_eq!(timestamps, (0..50).collect::<Vec<i64>>());
    assert!(out.iter().all(|event| event.values.contains_key("in_octets")));
}
