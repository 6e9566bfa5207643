//! Request normalization
//!
//! Builds the canonical [`Request`] the evaluator inspects, either from
//! raw HTTP parts or from the JSON ingest envelope an upstream proxy
//! posts. Both entry points produce the same shape: canonicalized
//! fields plus a flatten cache mapping CRS-style variable keys
//! (`ARGS:user`, `REQUEST_HEADERS:host`, `REQUEST_BODY`, ...) to their
//! ordered string values. The flatten cache is populated once here and
//! treated as immutable afterwards.

use crate::body::{parse_body, parse_form_fields, ParsedBody};
use crate::canon::{canonicalize, decode_component};
use crate::flatten::joined_form;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Canonical form of an inspected request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Uppercase HTTP verb.
    pub method: String,

    /// URL-decoded, canonicalized path.
    pub path: String,

    /// Query parameters, name to ordered values, in arrival order.
    pub query: Vec<(String, Vec<String>)>,

    /// Headers, lowercase name to canonicalized value. First occurrence
    /// wins for repeated headers.
    pub headers: Vec<(String, String)>,

    /// Cookies parsed from the `Cookie` header.
    pub cookies: Vec<(String, String)>,

    /// Full decoded body text, capped at the inspection limit.
    pub body_raw: String,

    /// Structured body value; an object for every input shape.
    pub body_struct: Value,

    /// CRS variable key to ordered values, derived from the fields
    /// above during normalization.
    pub flatten: Vec<(String, Vec<String>)>,
}

/// Ingest envelope posted by an upstream proxy instead of the raw
/// request.
#[derive(Debug, Clone, Deserialize)]
pub struct Ingest {
    /// HTTP verb; defaults to POST when absent.
    #[serde(default)]
    pub method: String,

    /// Request path.
    #[serde(default)]
    pub path: String,

    /// Query parameters.
    #[serde(default)]
    pub query: BTreeMap<String, Vec<String>>,

    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Structured body.
    #[serde(default)]
    pub body: Value,

    /// Verbatim body text, preferred for JSON content types so the
    /// salvage path can run on malformed payloads.
    #[serde(default)]
    pub raw_body: Option<String>,
}

impl Request {
    /// Build a canonical request from raw HTTP parts.
    ///
    /// `uri` is the request target (`/path?query`); `body` must already
    /// be capped at the configured inspection limit.
    pub fn from_http(method: &str, uri: &str, headers: &[(String, String)], body: &[u8]) -> Self {
        let (raw_path, raw_query) = match uri.split_once('?') {
            Some((p, q)) => (p, q),
            None => (uri, ""),
        };

        let mut req = Request {
            method: method.to_ascii_uppercase(),
            path: canonicalize(raw_path),
            ..Default::default()
        };

        for (name, values) in parse_form_fields(raw_query) {
            req.query.push((name, values));
        }

        let mut content_type = None;
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            if req.headers.iter().any(|(n, _)| *n == name) {
                continue;
            }
            if name == "content-type" {
                content_type = Some(value.clone());
            }
            req.headers.push((name, canonicalize(value)));
        }

        if let Some((_, cookie_header)) = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("cookie"))
        {
            req.cookies = parse_cookies(cookie_header);
        }

        let body_text = String::from_utf8_lossy(body);
        req.body_raw = canonicalize(&body_text);
        let parsed = parse_body(content_type.as_deref(), &body_text);
        req.finish(parsed, raw_query)
    }

    /// Build a canonical request from an ingest envelope.
    ///
    /// Behaves identically to [`Request::from_http`]; when the envelope
    /// headers indicate a JSON content type and `raw_body` is present,
    /// the raw text is parsed so salvage can run.
    pub fn from_ingest(ingest: Ingest) -> Self {
        let method = if ingest.method.is_empty() {
            "POST".to_string()
        } else {
            ingest.method.to_ascii_uppercase()
        };

        let mut req = Request {
            method,
            path: canonicalize(&ingest.path),
            ..Default::default()
        };

        for (name, values) in &ingest.query {
            req.query.push((
                decode_component(name),
                values.iter().map(|v| decode_component(v)).collect(),
            ));
        }

        let mut content_type = None;
        for (name, value) in &ingest.headers {
            let name = name.to_ascii_lowercase();
            if name == "content-type" {
                content_type = Some(value.clone());
            }
            if name == "cookie" {
                req.cookies = parse_cookies(value);
            }
            if req.headers.iter().any(|(n, _)| *n == name) {
                continue;
            }
            req.headers.push((name, canonicalize(value)));
        }

        let is_json = content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));

        let parsed = match &ingest.raw_body {
            Some(raw) if is_json || ingest.body.is_null() => {
                req.body_raw = canonicalize(raw);
                parse_body(content_type.as_deref(), raw)
            },
            _ => {
                let value = normalize_ingest_body(ingest.body);
                req.body_raw = joined_form(&value);
                ParsedBody {
                    value,
                    args: Vec::new(),
                }
            },
        };

        req.finish(parsed, "")
    }

    /// Populate the flatten cache from the parsed fields.
    fn finish(mut self, parsed: ParsedBody, raw_query: &str) -> Self {
        self.body_struct = parsed.value;

        self.flatten
            .push(("REQUEST_URI".to_string(), vec![self.path.clone()]));
        self.flatten
            .push(("REQUEST_METHOD".to_string(), vec![self.method.clone()]));
        if !raw_query.is_empty() {
            self.flatten
                .push(("QUERY_STRING".to_string(), vec![canonicalize(raw_query)]));
        }

        // ARGS: query values first, then form-style body fields.
        let mut args: Vec<(String, Vec<String>)> = Vec::new();
        for (name, values) in &self.query {
            push_values(&mut args, name, values);
        }
        for (name, values) in &parsed.args {
            push_values(&mut args, name, values);
        }
        for (name, values) in args {
            self.flatten.push((format!("ARGS:{name}"), values));
        }

        for (name, value) in &self.headers {
            self.flatten
                .push((format!("REQUEST_HEADERS:{name}"), vec![value.clone()]));
        }
        for (name, value) in &self.cookies {
            self.flatten
                .push((format!("REQUEST_COOKIES:{name}"), vec![value.clone()]));
        }

        let body_joined = joined_form(&self.body_struct);
        if !body_joined.is_empty() {
            self.flatten
                .push(("REQUEST_BODY".to_string(), vec![canonicalize(&body_joined)]));
        }

        self
    }

    /// Exact flatten lookup.
    pub fn flatten_get(&self, key: &str) -> Option<&[String]> {
        self.flatten
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Case-insensitive flatten lookup, used for header and cookie
    /// selectors.
    pub fn flatten_get_ci(&self, key: &str) -> Option<&[String]> {
        self.flatten
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_slice())
    }
}

/// Append values under `name`, merging repeats in arrival order.
fn push_values(args: &mut Vec<(String, Vec<String>)>, name: &str, values: &[String]) {
    match args.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => existing.extend(values.iter().cloned()),
        None => args.push((name.to_string(), values.to_vec())),
    }
}

/// Parse a `Cookie` header into name/value pairs.
fn parse_cookies(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), canonicalize(value.trim())))
        })
        .collect()
}

/// Apply the ingest malformed-args fix: a body of exactly one key with
/// an empty array value is really an unparsed raw payload.
fn normalize_ingest_body(body: Value) -> Value {
    if let Value::Object(ref map) = body {
        if map.len() == 1 {
            let (key, value) = map.iter().next().expect("len checked");
            if matches!(value, Value::Array(items) if items.is_empty()) {
                let mut out = Map::new();
                out.insert("raw".to_string(), Value::String(canonicalize(key)));
                return Value::Object(out);
            }
        }
        return body;
    }
    match body {
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut out = Map::new();
            out.insert("raw".to_string(), other);
            Value::Object(out)
        },
    }
}
