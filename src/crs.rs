//! Offline CRS converter
//!
//! One-shot transformation of ModSecurity Core Rule Set `.conf` trees
//! (`SecRule VARIABLE "OP PATTERN" "actions"`) into the per-category
//! TOML rule files the runtime loader consumes. Run once after pulling
//! a CRS release; the engine never parses raw `.conf` at runtime.

use crate::error::{WafError, WafResult};
use crate::rules::{RuleSpec, Severity};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Heuristic replacement for the `@detectSQLi` operator.
pub const DETECT_SQLI_PATTERN: &str =
    r"(?i)(union(\s+all)?\s+select|select.+from|insert\s+into|drop\s+table|update.+set|or\s+1=1)";

/// Heuristic replacement for the `@detectXSS` operator.
pub const DETECT_XSS_PATTERN: &str =
    r"(?i)(<script|onerror\s*=|onload\s*=|javascript:|alert\s*\()";

static SEC_RULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)^SecRule\s+(\S+)\s+"([^"]+)"\s+"([^"]+)""#).expect("static pattern")
});

/// Index file listing the generated rule files.
#[derive(Debug, Default, Serialize)]
struct RulesetIndex {
    load_rules: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RuleFileOut<'a> {
    rule: &'a [RuleSpec],
}

/// Conversion counters returned to the CLI.
#[derive(Debug, Default)]
pub struct ConvertSummary {
    /// `.conf` files visited
    pub files: usize,
    /// Rules emitted (chain links not counted separately)
    pub rules: usize,
    /// Category files written
    pub categories: usize,
}

/// Convert a CRS rules tree into a rule-definition directory.
///
/// Walks every `.conf` file under `src`, writes one
/// `rules_<category>.toml` per non-empty category plus a
/// `ruleset_config.toml` index into `dest`.
pub fn convert(src: &Path, dest: &Path) -> WafResult<ConvertSummary> {
    let mut conf_files = Vec::new();
    collect_conf_files(src, &mut conf_files)
        .map_err(|e| WafError::Load(format!("CRS source {}: {e}", src.display())))?;
    conf_files.sort();

    std::fs::create_dir_all(dest)
        .map_err(|e| WafError::Load(format!("destination {}: {e}", dest.display())))?;

    let mut categories: BTreeMap<String, Vec<RuleSpec>> = BTreeMap::new();
    let mut summary = ConvertSummary::default();

    for path in &conf_files {
        summary.files += 1;
        let category = detect_category(
            path.file_name()
                .map(|n| n.to_string_lossy())
                .unwrap_or_default()
                .as_ref(),
        );

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable conf file: {e}");
                continue;
            },
        };

        let rules = parse_conf(&content);
        debug!(path = %path.display(), rules = rules.len(), category, "parsed conf file");
        categories
            .entry(category.to_string())
            .or_default()
            .extend(rules);
    }

    let mut index = RulesetIndex::default();
    for (category, mut rules) in categories {
        if rules.is_empty() {
            continue;
        }
        // Stable numeric order within a category file.
        rules.sort_by_key(|r| r.id.parse::<u64>().unwrap_or(u64::MAX));
        summary.rules += rules.len();

        let filename = format!("rules_{category}.toml");
        let out = toml::to_string_pretty(&RuleFileOut { rule: &rules })
            .map_err(|e| WafError::Load(format!("serializing {category}: {e}")))?;
        std::fs::write(dest.join(&filename), out)
            .map_err(|e| WafError::Load(format!("writing {filename}: {e}")))?;
        index.load_rules.push(filename);
        summary.categories += 1;
    }

    let index_out = toml::to_string_pretty(&index)
        .map_err(|e| WafError::Load(format!("serializing index: {e}")))?;
    std::fs::write(dest.join("ruleset_config.toml"), index_out)
        .map_err(|e| WafError::Load(format!("writing ruleset_config.toml: {e}")))?;

    info!(
        files = summary.files,
        rules = summary.rules,
        categories = summary.categories,
        "CRS conversion complete"
    );
    Ok(summary)
}

fn collect_conf_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_conf_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "conf") {
            out.push(path);
        }
    }
    Ok(())
}

/// Parse one `.conf` file's text into rule specs.
///
/// Handles backslash line continuations, comment skipping and chain
/// collection: a rule whose actions contain `chain` opens a chain, and
/// every following rule is appended as a link until one without
/// `chain` closes it.
pub fn parse_conf(content: &str) -> Vec<RuleSpec> {
    let mut rules: Vec<RuleSpec> = Vec::new();
    let mut open_chain: Option<RuleSpec> = None;
    let mut buffer = String::new();

    for raw_line in content.lines() {
        let line = raw_line.trim();

        // Merge continued lines with a single space.
        if let Some(stripped) = line.strip_suffix('\\') {
            buffer.push_str(stripped.trim_end());
            buffer.push(' ');
            continue;
        }
        let line = if buffer.is_empty() {
            line.to_string()
        } else {
            let mut merged = std::mem::take(&mut buffer);
            merged.push_str(line);
            merged
        };

        if line.is_empty()
            || line.starts_with('#')
            || !line.to_ascii_uppercase().starts_with("SECRULE")
        {
            continue;
        }

        let Some(captures) = SEC_RULE.captures(&line) else {
            continue;
        };
        let variable = &captures[1];
        let operator = &captures[2];
        let actions = &captures[3];

        // Meta and control rules are not detection rules.
        if variable.starts_with("TX:") {
            continue;
        }
        if operator.starts_with("@lt") || operator.starts_with("@eq") || operator.starts_with("@gt")
        {
            continue;
        }

        let Some(pattern) = normalize_operator(operator) else {
            continue;
        };
        let (spec, continues_chain) = parse_actions(variable, &pattern, actions);

        match open_chain.take() {
            Some(mut outer) => {
                outer.chain.push(spec);
                if continues_chain {
                    open_chain = Some(outer);
                } else {
                    rules.push(outer);
                }
            },
            None => {
                if continues_chain {
                    open_chain = Some(spec);
                } else {
                    rules.push(spec);
                }
            },
        }
    }

    // A chain left open at end of file still carries its links.
    if let Some(outer) = open_chain {
        rules.push(outer);
    }

    rules
}

/// Normalize a CRS operator expression into a plain regex source.
fn normalize_operator(operator: &str) -> Option<String> {
    let operator = operator.trim();

    if let Some(pattern) = operator.strip_prefix("@rx ") {
        return Some(pattern.trim().to_string());
    }
    if let Some(words) = operator.strip_prefix("@pm ") {
        let alternatives: Vec<String> = words
            .split_whitespace()
            .map(regex::escape)
            .collect();
        if alternatives.is_empty() {
            return None;
        }
        return Some(format!("(?i)({})", alternatives.join("|")));
    }
    if let Some(value) = operator.strip_prefix("@streq ") {
        return Some(format!("^{}$", regex::escape(value.trim())));
    }
    if operator == "@detectSQLi" {
        return Some(DETECT_SQLI_PATTERN.to_string());
    }
    if operator == "@detectXSS" {
        return Some(DETECT_XSS_PATTERN.to_string());
    }

    // No recognized operator prefix: the expression is the pattern.
    Some(operator.to_string())
}

/// Extract rule metadata from a CRS action list.
///
/// Returns the spec and whether the actions contain `chain`.
fn parse_actions(variable: &str, pattern: &str, actions: &str) -> (RuleSpec, bool) {
    let mut spec = RuleSpec {
        variable: variable.to_string(),
        regex: pattern.to_string(),
        phase: 1,
        block: actions.contains("block") || actions.contains("deny"),
        ..Default::default()
    };
    let mut chained = false;

    for part in actions.split(',') {
        let part = part.trim();
        if part == "chain" {
            chained = true;
        } else if let Some(id) = part.strip_prefix("id:") {
            spec.id = id.trim().to_string();
        } else if let Some(msg) = part.strip_prefix("msg:") {
            spec.name = trim_quotes(msg).to_string();
        } else if let Some(phase) = part.strip_prefix("phase:") {
            if let Ok(phase) = phase.trim().parse::<u8>() {
                spec.phase = phase;
            }
        } else if let Some(severity) = strip_prefix_ci(part, "severity:") {
            spec.severity = Severity::parse(trim_quotes(severity));
        } else if let Some(transform) = part.strip_prefix("t:") {
            spec.transforms.push(transform.trim().to_string());
        } else if let Some(tag) = part.strip_prefix("tag:") {
            spec.tags.push(trim_quotes(tag).to_string());
        } else if let Some(level) = part.strip_prefix("paranoia-level:") {
            spec.paranoia_level = level.trim().parse().unwrap_or(0);
        } else if let Some(ctl) = part.strip_prefix("ctl:") {
            spec.controls.push(ctl.trim().to_string());
        }
    }

    // Request-phase rules only; later phases collapse onto the body
    // phase the evaluator knows about.
    if spec.phase > 2 {
        spec.phase = 2;
    }
    if spec.phase == 0 {
        spec.phase = 1;
    }

    (spec, chained)
}

fn trim_quotes(s: &str) -> &str {
    s.trim().trim_matches(|c| c == '\'' || c == '"')
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Map a CRS filename onto a rule category.
pub fn detect_category(filename: &str) -> &'static str {
    const CATEGORIES: [(&str, &str); 13] = [
        ("911", "method-enforcement"),
        ("920", "protocol-enforcement"),
        ("930", "rfi"),
        ("931", "lfi"),
        ("932", "rce"),
        ("933", "php"),
        ("934", "generic"),
        ("941", "xss"),
        ("942", "sqli"),
        ("943", "session-fixation"),
        ("944", "java"),
        ("959", "blocking-evaluation"),
        ("980", "correlation"),
    ];

    CATEGORIES
        .iter()
        .find(|(prefix, _)| filename.contains(prefix))
        .map(|(_, category)| *category)
        .unwrap_or("misc")
}
