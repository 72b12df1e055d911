use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::traits::{Event, Getter};
use crate::value::Val;

fn json_to_val(value: &Value) -> Option<Val<'_>> {
    Some(match value {
        Value::Bool(value) => Val::Bool(*value),
        Value::Number(number) => {
            if let Some(value) = number.as_u64() {
                Val::U64(value)
            } else if let Some(value) = number.as_i64() {
                Val::I64(value)
            } else {
                Val::F64(number.as_f64()?)
            }
        }
        Value::String(value) => Val::String(value),
        Value::Null | Value::Array(_) | Value::Object(_) => return None,
    })
}

fn json_member<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => items.get(key.parse::<usize>().ok()?),
        _ => None,
    }
}

/// JSON objects are accessed by key, arrays by index.
impl Getter for Value {
    fn get_value(&self, path: &str) -> Option<Val<'_>> {
        json_to_val(json_member(self, path)?)
    }

    fn get_child(&self, name: &str) -> Option<&dyn Getter> {
        json_member(self, name)
            .filter(|child| child.is_object() || child.is_array())
            .map(|child| child as &dyn Getter)
    }
}

/// An event with a free-form JSON payload.
///
/// Paths are resolved against the payload. The path `name` falls back to the event name if the
/// payload has no such field.
///
/// # Example
///
/// ```
/// use tally_protocol::{JsonEvent, Val, resolve};
///
/// let event = JsonEvent::new("user.login", serde_json::json!({"user": {"id": 42}}));
/// assert_eq!(resolve(&event, "user.id"), Ok(Val::U64(42)));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct JsonEvent {
    /// The name of the event.
    pub name: String,
    /// The payload carrying the event's data.
    #[serde(default)]
    pub payload: Value,
}

impl JsonEvent {
    /// Creates a new JSON event.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

impl Getter for JsonEvent {
    fn get_value(&self, path: &str) -> Option<Val<'_>> {
        match self.payload.get_value(path) {
            Some(value) => Some(value),
            None if path == "name" => Some(self.name.as_str().into()),
            None => None,
        }
    }

    fn get_child(&self, name: &str) -> Option<&dyn Getter> {
        self.payload.get_child(name)
    }
}

impl Event for JsonEvent {
    fn name(&self) -> &str {
        &self.name
    }
}
