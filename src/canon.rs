//! Input canonicalization
//!
//! Every value the evaluator sees goes through the same pipeline:
//! recursive percent-unescape, Unicode NFKC, then full-width ASCII
//! folding. Attackers routinely stack encodings (`%253Cscript%253E`) or
//! swap ASCII for full-width homoglyphs to slip past naive matchers;
//! canonicalizing first means rule patterns only have to describe the
//! plain form.

use percent_encoding::percent_decode_str;
use unicode_normalization::UnicodeNormalization;

/// Maximum unescape passes before giving up on a still-changing input.
const MAX_UNESCAPE_DEPTH: usize = 5;

/// Canonicalize a string value.
///
/// Idempotent after one application: `canonicalize(canonicalize(x)) ==
/// canonicalize(x)` for any input that stabilizes within the unescape
/// depth cap.
pub fn canonicalize(input: &str) -> String {
    let decoded = recursive_unescape(input);
    let normalized: String = decoded.nfkc().collect();
    fold_fullwidth(&normalized)
}

/// Repeatedly percent-decode until the value stops changing.
///
/// Capped at [`MAX_UNESCAPE_DEPTH`] passes so a deeply nested encoding
/// cannot pin the CPU. A pass that produces invalid UTF-8 keeps the
/// previous form.
pub fn recursive_unescape(input: &str) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_UNESCAPE_DEPTH {
        let decoded = match percent_decode_str(&current).decode_utf8() {
            Ok(d) => d.into_owned(),
            Err(_) => break,
        };
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

/// Decode a single query-string component.
///
/// Form encoding uses `+` for spaces; fold those before the shared
/// canonicalization pipeline runs.
pub fn decode_component(input: &str) -> String {
    canonicalize(&input.replace('+', " "))
}

/// Map full-width ASCII variants (U+FF01..U+FF5E) onto their ASCII
/// counterparts.
fn fold_fullwidth(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            let cp = c as u32;
            if (0xFF01..=0xFF5E).contains(&cp) {
                // Offset between the full-width block and ASCII.
                char::from_u32(cp - 0xFEE0).unwrap_or(c)
            } else {
                c
            }
        })
        .collect()
}
