//! Nested-JSON flattening
//!
//! Parsed bodies are generic [`serde_json::Value`] trees. Rules match
//! flat strings, so two projections are derived:
//!
//! - a joined form, one string for quick regex sweeps over the whole
//!   body (`user=admin&items=1,2`)
//! - a keyed form, one entry per leaf with dot/bracket notation keys
//!   (`user.name`, `items[0].price`) for per-field inspection

use serde_json::Value;

/// Flatten a value into a single joined string.
///
/// Objects become `key=<sub>&key=<sub>`, arrays become `<sub>,<sub>`,
/// primitives are stringified (`null`, `true`/`false`, shortest
/// round-trip numbers).
pub fn joined_form(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(key, val)| format!("{}={}", key, joined_form(val)))
                .collect();
            parts.join("&")
        },
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(joined_form).collect();
            parts.join(",")
        },
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

/// Flatten a value into keyed leaf entries.
///
/// Object nesting uses dot notation, array indices use bracket notation.
/// The returned pairs are in document order (object keys sorted, array
/// order preserved).
pub fn keyed_form(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    flatten_into(value, "", &mut out);
    out
}

fn flatten_into(value: &Value, prefix: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let full_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(val, &full_key, out);
            }
        },
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(item, &format!("{prefix}[{i}]"), out);
            }
        },
        leaf => {
            out.push((prefix.to_string(), joined_form(leaf)));
        },
    }
}
