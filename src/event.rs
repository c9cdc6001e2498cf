use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::gnmi::{Notification, Path, TypedValue};

/// A scalar carried in an event's value map.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(b) => Some(u8::from(*b) as f64),
            Value::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => v.fmt(f),
            Value::Int(v) => v.fmt(f),
            Value::Uint(v) => v.fmt(f),
            Value::Float(v) => v.fmt(f),
            Value::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl TryFrom<&TypedValue> for Value {
    type Error = ();

    fn try_from(value: &TypedValue) -> Result<Self, Self::Error> {
        match value {
            TypedValue::Bool(v) => Ok(Value::Bool(*v)),
            TypedValue::Int(v) => Ok(Value::Int(*v)),
            TypedValue::Uint(v) => Ok(Value::Uint(*v)),
            TypedValue::Double(v) => Ok(Value::Float(*v)),
            TypedValue::String(v) => Ok(Value::String(v.clone())),
            TypedValue::Json(serde_json::Value::Number(n)) => {
                if let Some(v) = n.as_i64() {
                    Ok(Value::Int(v))
                } else if let Some(v) = n.as_u64() {
                    Ok(Value::Uint(v))
                } else if let Some(v) = n.as_f64() {
                    Ok(Value::Float(v))
                } else {
                    Err(())
                }
            }
            TypedValue::Json(serde_json::Value::String(s)) => Ok(Value::String(s.clone())),
            TypedValue::Json(serde_json::Value::Bool(b)) => Ok(Value::Bool(*b)),
            TypedValue::Json(_) => Err(()),
        }
    }
}

/// The flat record everything downstream of a subscription operates on.
/// Processors may mutate every field.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct EventMsg {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Nanoseconds since the unix epoch.
    #[serde(default)]
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub tags: IndexMap<String, String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub values: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<String>,
}

impl EventMsg {
    pub fn new(name: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.deletes.is_empty()
    }

    /// JSON view used by condition evaluation.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Convert one notification into events, one per update plus at most one
/// carrying the deletes. List keys along every path become tags; key
/// collisions with different values get the full path prepended.
pub fn events_from_notification(
    name: &str,
    notification: &Notification,
    meta: &IndexMap<String, String>,
) -> Vec<EventMsg> {
    let mut events = Vec::with_capacity(notification.updates.len() + 1);

    for update in &notification.updates {
        let full = Path::joined(notification.prefix.as_ref(), &update.path);
        let mut event = EventMsg::new(name, notification.timestamp);

        for (key, value) in meta {
            event.tags.insert(key.clone(), value.clone());
        }
        collect_key_tags(&full, &mut event);

        let Ok(value) = Value::try_from(&update.value) else {
            continue;
        };
        event.values.insert(strip_keys(&full), value);

        events.push(event);
    }

    if !notification.deletes.is_empty() {
        let mut event = EventMsg::new(name, notification.timestamp);
        for (key, value) in meta {
            event.tags.insert(key.clone(), value.clone());
        }

        for delete in &notification.deletes {
            let full = Path::joined(notification.prefix.as_ref(), delete);
            collect_key_tags(&full, &mut event);
            event.deletes.push(strip_keys(&full));
        }

        events.push(event);
    }

    events
}

fn collect_key_tags(path: &Path, event: &mut EventMsg) {
    for elem in &path.elem {
        for (key, value) in &elem.key {
            match event.tags.get(key) {
                Some(existing) if existing != value => {
                    event
                        .tags
                        .insert(format!("{}_{}", elem.name, key), value.clone());
                }
                _ => {
                    event.tags.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

fn strip_keys(path: &Path) -> String {
    let mut out = String::new();

    for elem in &path.elem {
        out.push('/');
        out.push_str(&elem.name);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnmi::{xpath, Update};

    fn meta() -> IndexMap<String, String> {
        IndexMap::from([
            ("source".to_string(), "leaf1:57400".to_string()),
            ("subscription-name".to_string(), "port-stats".to_string()),
        ])
    }

    #[test]
    fn update_to_event() {
        let notification = Notification {
            timestamp: 42,
            prefix: Some(xpath::parse("/interfaces/interface[name=ethernet1/1]").unwrap()),
            updates: vec![Update {
                path: xpath::parse("state/counters/in-octets").unwrap(),
                value: TypedValue::Uint(1024),
            }],
            deletes: vec![],
        };

        let events = events_from_notification("port-stats", &notification, &meta());
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.name, "port-stats");
        assert_eq!(event.timestamp, 42);
        assert_eq!(event.tags["name"], "ethernet1/1");
        assert_eq!(event.tags["source"], "leaf1:57400");
        assert_eq!(
            event.values["/interfaces/interface/state/counters/in-octets"],
            Value::Uint(1024)
        );
    }

    #[test]
    fn deletes_become_their_own_event() {
        let notification = Notification {
            timestamp: 7,
            prefix: None,
            updates: vec![],
            deletes: vec![xpath::parse("/interfaces/interface[name=lo0]").unwrap()],
        };

        let events = events_from_notification("port-stats", &notification, &meta());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].deletes, vec!["/interfaces/interface"]);
        assert_eq!(events[0].tags["name"], "lo0");
    }

    #[test]
    fn colliding_keys_are_prefixed() {
        let notification = Notification {
            timestamp: 1,
            prefix: None,
            updates: vec![Update {
                path: xpath::parse("/a[name=one]/b[name=two]/c").unwrap(),
                value: TypedValue::Int(1),
            }],
            deletes: vec![],
        };

        let events = events_from_notification("s", &notification, &IndexMap::new());
        assert_eq!(events[0].tags["name"], "one");
        assert_eq!(events[0].tags["b_name"], "two");
    }

    #[test]
    fn value_serializes_untagged() {
        let mut event = EventMsg::new("s", 1);
        event.values.insert("up".into(), Value::Bool(true));
        event.values.insert("count".into(), Value::Uint(3));

        let json = event.to_json();
        assert_eq!(json["values"]["up"], serde_json::json!(true));
        assert_eq!(json["values"]["count"], serde_json::json!(3));
    }
}
