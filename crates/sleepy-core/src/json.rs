//! JSON helpers shared by the settings store, event history and combiner.

use serde_json::{Map, Number, Value};

/// Builder for one flat JSON object handed to fragment and history callbacks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JsonObjectWriter {
    map: Map<String, Value>,
}

impl JsonObjectWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.map.insert(key.to_owned(), value.into());
        self
    }

    /// Inserts `value` rounded to `decimals` places.
    pub fn insert_rounded(&mut self, key: &str, value: f64, decimals: u32) -> &mut Self {
        let scale = 10f64.powi(decimals as i32);
        let rounded = (value * scale).round() / scale;
        match Number::from_f64(rounded) {
            Some(number) => self.insert(key, Value::Number(number)),
            None => self.insert(key, Value::Null),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.map
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.map
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.map.clone()).to_string()
    }
}

/// Copies a parsed value, writing integral doubles back as integers.
pub fn json_copy(value: &Value) -> Value {
    match value {
        Value::Number(number) => Value::Number(normalize_number(number)),
        Value::Array(items) => Value::Array(items.iter().map(json_copy).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), json_copy(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn normalize_number(number: &Number) -> Number {
    if number.is_i64() || number.is_u64() {
        return number.clone();
    }
    match number.as_f64() {
        Some(d) if d == d.floor() && d.abs() < i64::MAX as f64 => Number::from(d as i64),
        _ => number.clone(),
    }
}

/// Type-and-bytes equality used for change detection.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    same_kind(a, b) && a.to_string() == b.to_string()
}

fn same_kind(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.is_f64() == y.is_f64(),
        _ => core::mem::discriminant(a) == core::mem::discriminant(b),
    }
}

pub(crate) fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integral_doubles_become_integers() {
        let copied = json_copy(&json!({"a": 2.0, "b": 2.5, "c": [1.0, "x"], "d": {"e": -3.0}}));
        assert_eq!(copied.to_string(), r#"{"a":2,"b":2.5,"c":[1,"x"],"d":{"e":-3}}"#);
    }

    #[test]
    fn int_and_double_differ_even_when_equal_numerically() {
        assert!(!same_value(&json!(1), &json!(1.0)));
        assert!(same_value(&json!("x"), &json!("x")));
        assert!(!same_value(&json!("1"), &json!(1)));
    }

    #[test]
    fn writer_rounds_to_requested_places() {
        let mut writer = JsonObjectWriter::new();
        writer.insert_rounded("soc", 87.46, 1).insert("n", 3);
        assert_eq!(writer.to_json(), r#"{"soc":87.5,"n":3}"#);
    }
}
