//! Property tests for the snapshot diff every loader relies on.

use std::collections::HashMap;

use gnmic::config::TargetConfig;
use gnmic::loaders::diff;
use proptest::prelude::*;

fn target_strategy() -> impl Strategy<Value = TargetConfig> {
    (
        prop::sample::select(vec!["10.0.0.1:57400", "10.0.0.2:57400", "10.0.0.3:57400"]),
        prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "d"]), 0..4),
        prop::option::of(prop::sample::select(vec!["admin", "oper"])),
    )
        .prop_map(|(address, tags, username)| TargetConfig {
            address: address.to_string(),
            tags: tags.into_iter().map(str::to_string).collect(),
            username: username.map(str::to_string),
            ..Default::default()
        })
}

fn snapshot_strategy() -> impl Strategy<Value = HashMap<String, TargetConfig>> {
    prop::collection::hash_map(
        prop::sample::select(vec!["t1", "t2", "t3", "t4", "t5", "t6"]),
        target_strategy(),
        0..6,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .map(|(name, mut tc)| {
                tc.name = name.to_string();
                (name.to_string(), tc)
            })
            .collect()
    })
}

proptest! {
    /// Applying the diff to the previous snapshot reproduces the next one:
    /// Add plus unchanged entries is exactly B, Del plus unchanged is
    /// exactly the keys of A.
    #[test]
    fn diff_reconstructs_snapshots(
        prev in snapshot_strategy(),
        next in snapshot_strategy(),
    ) {
        let op = diff(&prev, &next);

        // apply: remove Del, insert Add
        let mut applied = prev.clone();
        for name in &op.del {
            applied.remove(name);
        }
        for (name, tc) in &op.add {
            applied.insert(name.clone(), tc.clone());
        }

        prop_assert_eq!(&applied, &next);

        // Add keys exist in next with the same value
        for (name, tc) in &op.add {
            prop_assert_eq!(next.get(name), Some(tc));
        }

        // Del keys existed in prev
        for name in &op.del {
            prop_assert!(prev.contains_key(name));
        }

        // untouched keys were identical in both
        for (name, tc) in &prev {
            let added = op.add.contains_key(name);
            let deleted = op.del.contains(name);
            if !added && !deleted {
                prop_assert_eq!(next.get(name), Some(tc));
            }
        }
    }

    #[test]
    fn diff_of_identical_snapshots_is_empty(snapshot in snapshot_strategy()) {
        let op = diff(&snapshot, &snapshot);
        prop_assert!(op.add.is_empty());
        prop_assert!(op.del.is_empty());
    }

    /// A changed entry always shows up on both sides, delete-then-add.
    #[test]
    fn changed_entry_is_delete_then_add(
        prev in snapshot_strategy(),
        next in snapshot_strategy(),
    ) {
        let op = diff(&prev, &next);

        for (name, tc) in &prev {
            if let Some(new) = next.get(name) {
                if new != tc {
                    prop_assert!(op.add.contains_key(name));
                    prop_assert!(op.del.contains(name));
                }
            }
        }
    }
}

#[test]
fn tag_order_change_is_detected() {
    let mut prev = HashMap::new();
    prev.insert(
        "t".to_string(),
        TargetConfig {
            name: "t".into(),
            tags: vec!["a".into(), "b".into()],
            ..Default::default()
        },
    );

    let mut next = HashMap::new();
    next.insert(
        "t".to_string(),
        TargetConfig {
            name: "t".into(),
            tags: vec!["b".into(), "a".into()],
            ..Default::default()
        },
    );

    let op = diff(&prev, &next);
    assert_eq!(op.add["t"].tags, vec!["b", "a"]);
    assert_eq!(op.del, vec!["t"]);
}
