//! Optional on-change cache between an output's processor chain and its
//! workers: only values that actually changed since the last flush travel
//! downstream. Useful against sinks billed or sized by write volume.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::event::EventMsg;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct CacheConfig {
    #[serde(default = "default_flush_timer", with = "humantime_serde")]
    pub flush_timer: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            flush_timer: default_flush_timer(),
        }
    }
}

const fn default_flush_timer() -> Duration {
    Duration::from_secs(5)
}

struct Entry {
    event: EventMsg,
    changed: bool,
}

/// Latest event per series, where a series is the event name plus its
/// sorted tag set. An insert marks the series changed only when values,
/// deletes or tags differ from what the cache already holds.
#[derive(Default)]
pub struct OnChangeCache {
    entries: Mutex<HashMap<String, Entry>>,
}

fn series_key(event: &EventMsg) -> String {
    let mut tags: Vec<(&String, &String)> = event.tags.iter().collect();
    tags.sort();

    let mut key = event.name.clone();
    for (name, value) in tags {
        key.push(',');
        key.push_str(name);
        key.push('=');
        key.push_str(value);
    }
    key
}

fn same_payload(a: &EventMsg, b: &EventMsg) -> bool {
    a.values == b.values && a.deletes == b.deletes && a.tags == b.tags
}

impl OnChangeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, events: Vec<EventMsg>) {
        let mut entries = self.entries.lock();

        for event in events {
            if event.is_empty() {
                continue;
            }

            let key = series_key(&event);
            match entries.get_mut(&key) {
                Some(entry) if same_payload(&entry.event, &event) => {
                    // same state again, only the timestamp moves
                    entry.event.timestamp = event.timestamp;
                }
                Some(entry) => {
                    entry.event = event;
                    entry.changed = true;
                }
                None => {
                    entries.insert(
                        key,
                        Entry {
                            event,
                            changed: true,
                        },
                    );
                }
            }
        }
    }

    /// Take everything that changed since the previous drain, in series
    /// order.
    pub fn drain_changed(&self) -> Vec<EventMsg> {
        let mut entries = self.entries.lock();

        let mut changed: Vec<(String, EventMsg)> = entries
            .iter_mut()
            .filter(|(_, entry)| entry.changed)
            .map(|(key, entry)| {
                entry.changed = false;
                (key.clone(), entry.event.clone())
            })
            .collect();

        changed.sort_by(|(a, _), (b, _)| a.cmp(b));
        changed.into_iter().map(|(_, event)| event).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;

    fn event(interface: &str, octets: u64, ts: i64) -> EventMsg {
        let mut event = EventMsg::new("port-stats", ts);
        event
            .tags
            .insert("interface".to_string(), interface.to_string());
        event
            .values
            .insert("in-octets".to_string(), Value::Uint(octets));
        event
    }

    #[test]
    fn first_insert_is_a_change() {
        let cache = OnChangeCache::new();
        cache.insert(vec![event("eth1", 1, 10)]);

        let drained = cache.drain_changed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].values["in-octets"], Value::Uint(1));
    }

    #[test]
    fn unchanged_value_is_suppressed() {
        let cache = OnChangeCache::new();
        cache.insert(vec![event("eth1", 1, 10)]);
        cache.drain_changed();

        cache.insert(vec![event("eth1", 1, 20)]);
        assert!(cache.drain_changed().is_empty());

        cache.insert(vec![event("eth1", 2, 30)]);
        let drained = cache.drain_changed();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].timestamp, 30);
    }

    #[test]
    fn series_split_by_tags() {
        let cache = OnChangeCache::new();
        cache.insert(vec![event("eth1", 1, 10), event("eth2", 1, 10)]);

        let drained = cache.drain_changed();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn drain_twice_is_empty() {
        let cache = OnChangeCache::new();
        cache.insert(vec![event("eth1", 1, 10)]);
        cache.drain_changed();
        assert!(cache.drain_changed().is_empty());
    }
}
