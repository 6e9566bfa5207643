//! Request-body parsing
//!
//! Dispatches on the `Content-Type` media type and reduces every body
//! shape to a generic JSON value plus, for form-style bodies, named
//! argument fields. A request is never rejected for a malformed body:
//! JSON gets a salvage pass, everything else falls back to a raw-text
//! representation that the rules still sweep.

use crate::canon::{canonicalize, decode_component, recursive_unescape};
use serde_json::{Map, Value};
use tracing::debug;

/// Maximum body size inspected, in bytes. Bytes beyond are dropped.
pub const MAX_BODY_SIZE: usize = 1 << 20;

/// A parsed request body.
#[derive(Debug, Clone)]
pub struct ParsedBody {
    /// Structured representation; an object for every input shape.
    pub value: Value,

    /// Named fields for form-style bodies (urlencoded, multipart), in
    /// document order. Empty for JSON and raw bodies.
    pub args: Vec<(String, Vec<String>)>,
}

impl Default for ParsedBody {
    fn default() -> Self {
        Self {
            value: Value::Object(Map::new()),
            args: Vec::new(),
        }
    }
}

impl ParsedBody {
    fn raw(text: String) -> Self {
        let mut map = Map::new();
        map.insert("raw".to_string(), Value::String(text));
        Self {
            value: Value::Object(map),
            args: Vec::new(),
        }
    }
}

/// Parse a request body according to its `Content-Type`.
///
/// `raw` must already be capped at [`MAX_BODY_SIZE`]; the request
/// normalizer truncates before calling.
pub fn parse_body(content_type: Option<&str>, raw: &str) -> ParsedBody {
    if raw.is_empty() {
        return ParsedBody::default();
    }

    let (media_type, params) = split_media_type(content_type.unwrap_or(""));

    if media_type.contains("json") {
        parse_json_body(raw)
    } else if media_type == "application/x-www-form-urlencoded" {
        parse_form_body(raw)
    } else if media_type == "multipart/form-data" {
        match boundary_param(&params) {
            Some(boundary) => parse_multipart_body(raw, &boundary),
            None => ParsedBody::raw(canonicalize(raw)),
        }
    } else {
        ParsedBody::raw(canonicalize(raw))
    }
}

/// Split a Content-Type header into lowercase media type and parameters.
fn split_media_type(header: &str) -> (String, Vec<String>) {
    let mut parts = header.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let params = parts.map(|p| p.trim().to_string()).collect();
    (media_type, params)
}

/// Extract the `boundary` parameter, unquoting if needed.
fn boundary_param(params: &[String]) -> Option<String> {
    params.iter().find_map(|p| {
        let (key, value) = p.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Parse a JSON body, salvaging malformed payloads.
fn parse_json_body(raw: &str) -> ParsedBody {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return ParsedBody {
            value: ensure_object(value),
            args: Vec::new(),
        };
    }

    // Salvage pass one: the payload may be percent-encoded JSON.
    let unescaped = recursive_unescape(raw);
    if unescaped != raw {
        if let Ok(value) = serde_json::from_str::<Value>(&unescaped) {
            return ParsedBody {
                value: ensure_object(value),
                args: Vec::new(),
            };
        }
    }

    // Salvage pass two: best-effort key/value split so truncated or
    // unbalanced JSON still yields inspectable fields.
    debug!("malformed JSON body, using salvage representation");
    let mut map = Map::new();
    map.insert("raw".to_string(), Value::String(canonicalize(raw)));
    for (key, value) in salvage_pairs(raw) {
        map.entry(key).or_insert(Value::String(value));
    }
    ParsedBody {
        value: Value::Object(map),
        args: Vec::new(),
    }
}

/// Split malformed JSON into key/value pairs: strip outer braces, split
/// on commas, then on the first colon of each part.
fn salvage_pairs(raw: &str) -> Vec<(String, String)> {
    let trimmed = raw.trim().trim_matches(|c| c == '{' || c == '}');
    trimmed
        .split(',')
        .filter_map(|part| {
            let (key, value) = part.split_once(':')?;
            let key = strip_quotes(&canonicalize(key));
            let value = strip_quotes(&canonicalize(value));
            if key.is_empty() || value.is_empty() {
                None
            } else {
                Some((key, value))
            }
        })
        .collect()
}

fn strip_quotes(s: &str) -> String {
    s.trim().trim_matches('"').trim().to_string()
}

/// Wrap non-object JSON values so the body is always keyed.
fn ensure_object(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert("raw".to_string(), other);
            Value::Object(map)
        },
    }
}

/// Parse `application/x-www-form-urlencoded` bodies.
fn parse_form_body(raw: &str) -> ParsedBody {
    let fields = parse_form_fields(raw);
    if fields.is_empty() {
        return ParsedBody::raw(decode_component(raw));
    }

    let mut map = Map::new();
    for (name, values) in &fields {
        map.insert(
            name.clone(),
            Value::Array(
                values
                    .iter()
                    .map(|v| Value::String(v.clone()))
                    .collect(),
            ),
        );
    }
    ParsedBody {
        value: Value::Object(map),
        args: fields,
    }
}

/// Decode `name=value&name=value` pairs, preserving order and repeats.
pub fn parse_form_fields(raw: &str) -> Vec<(String, Vec<String>)> {
    let mut fields: Vec<(String, Vec<String>)> = Vec::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name.is_empty() {
            continue;
        }
        // A bare token with no '=' is not a form field; a body of only
        // such tokens falls back to the raw representation.
        if value.is_empty() && !pair.contains('=') {
            continue;
        }
        let name = decode_component(name);
        let value = decode_component(value);
        match fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => fields.push((name, vec![value])),
        }
    }
    fields
}

/// Parse `multipart/form-data`, keeping only non-file field values.
fn parse_multipart_body(raw: &str, boundary: &str) -> ParsedBody {
    let delimiter = format!("--{boundary}");
    let mut fields: Vec<(String, Vec<String>)> = Vec::new();

    for section in raw.split(delimiter.as_str()) {
        let section = section.trim_start_matches("\r\n").trim_start_matches('\n');
        if section.is_empty() || section.starts_with("--") {
            continue;
        }

        let (headers, value) = match section.split_once("\r\n\r\n") {
            Some(split) => split,
            None => match section.split_once("\n\n") {
                Some(split) => split,
                None => continue,
            },
        };

        let disposition = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"));
        let Some(disposition) = disposition else {
            continue;
        };

        // File parts carry a filename attribute and are not inspected.
        if disposition.to_ascii_lowercase().contains("filename=") {
            continue;
        }
        let Some(name) = disposition_name(disposition) else {
            continue;
        };

        let value = canonicalize(value.trim_end_matches(['\r', '\n']));
        match fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => fields.push((name, vec![value])),
        }
    }

    if fields.is_empty() {
        return ParsedBody::raw(canonicalize(raw));
    }

    let mut map = Map::new();
    for (name, values) in &fields {
        map.insert(
            name.clone(),
            Value::Array(
                values
                    .iter()
                    .map(|v| Value::String(v.clone()))
                    .collect(),
            ),
        );
    }
    ParsedBody {
        value: Value::Object(map),
        args: fields,
    }
}

/// Pull the `name` attribute out of a Content-Disposition header line.
fn disposition_name(header: &str) -> Option<String> {
    header.split(';').find_map(|attr| {
        let (key, value) = attr.trim().split_once('=')?;
        if key.trim().eq_ignore_ascii_case("name") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}
