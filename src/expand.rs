//! CRS variable-expression expansion
//!
//! A rule's `variable` field is a `|`-separated list of terms such as
//! `ARGS|REQUEST_HEADERS:User-Agent|REQUEST_COOKIES:*`. Each term
//! resolves independently against the request's flatten cache; the
//! candidate lists are concatenated in term order.

use crate::request::Request;

const ARGS_PREFIX: &str = "ARGS:";
const HEADERS_PREFIX: &str = "REQUEST_HEADERS:";
const COOKIES_PREFIX: &str = "REQUEST_COOKIES:";

/// Expand a variable expression into its candidate values.
pub fn expand(expr: &str, req: &Request) -> Vec<String> {
    expr.split('|')
        .flat_map(|term| expand_term(term.trim(), req))
        .collect()
}

/// Expand an expression keeping the originating term with each
/// candidate list, so the evaluator can attribute a match to the
/// variable it came from.
pub fn expand_with_terms(expr: &str, req: &Request) -> Vec<(String, Vec<String>)> {
    expr.split('|')
        .map(|term| {
            let term = term.trim();
            (term.to_string(), expand_term(term, req))
        })
        .collect()
}

/// Resolve a single term.
fn expand_term(term: &str, req: &Request) -> Vec<String> {
    let upper = term.to_ascii_uppercase();

    match upper.as_str() {
        "ARGS" | "ARGS:*" => prefix_values(req, ARGS_PREFIX),
        "ARGS_NAMES" => req
            .flatten
            .iter()
            .filter_map(|(key, _)| key.strip_prefix(ARGS_PREFIX))
            .map(str::to_string)
            .collect(),
        "REQUEST_BODY" | "REQUEST_URI" | "REQUEST_METHOD" | "QUERY_STRING" => req
            .flatten_get(&upper)
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
        "REQUEST_HEADERS" | "REQUEST_HEADERS:*" => prefix_values(req, HEADERS_PREFIX),
        "REQUEST_COOKIES" | "REQUEST_COOKIES:*" => prefix_values(req, COOKIES_PREFIX),
        // Diagnostic fallback: every value in the flatten cache.
        "*" => req
            .flatten
            .iter()
            .flat_map(|(_, values)| values.iter().cloned())
            .collect(),
        _ => {
            if upper.starts_with(ARGS_PREFIX)
                || upper.starts_with(HEADERS_PREFIX)
                || upper.starts_with(COOKIES_PREFIX)
            {
                // Named selector; names are matched case-insensitively.
                req.flatten_get_ci(term)
                    .map(<[String]>::to_vec)
                    .unwrap_or_default()
            } else {
                Vec::new()
            }
        },
    }
}

/// All values stored under keys with the given prefix, in cache order.
fn prefix_values(req: &Request, prefix: &str) -> Vec<String> {
    req.flatten
        .iter()
        .filter(|(key, _)| key.starts_with(prefix))
        .flat_map(|(_, values)| values.iter().cloned())
        .collect()
}
