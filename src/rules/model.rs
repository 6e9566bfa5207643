//! Rule records and the in-memory rule set

use crate::cache::PatternCache;
use crate::canon::recursive_unescape;
use crate::error::{WafError, WafResult};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

/// Rule severity, as written in CRS actions.
///
/// Parsing is case-insensitive; unknown values fall back to `Notice`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational
    #[default]
    Notice,
    /// Suspicious but common in legitimate traffic
    Warning,
    /// Likely attack
    Error,
    /// Confirmed attack pattern; feeds the critical-score threshold
    Critical,
}

impl Severity {
    /// Parse a severity tag, case-insensitive, unknown to `Notice`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "CRITICAL" => Self::Critical,
            _ => Self::Notice,
        }
    }

    /// Display name, CRS uppercase convention.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

/// Value transformation applied before pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// ASCII-insensitive rules still expect lowercase comparison text
    Lowercase,
    /// One extra URL-decode pass beyond canonicalization
    UrlDecode,
    /// Strip surrounding whitespace
    Trim,
}

impl Transform {
    /// Parse a CRS transformation tag. Unknown tags yield `None` and
    /// are ignored without error.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim() {
            "lowercase" => Some(Self::Lowercase),
            "urlDecode" => Some(Self::UrlDecode),
            "trim" => Some(Self::Trim),
            _ => None,
        }
    }

    /// Apply the transformation, allocating only when the value changes.
    pub fn apply<'a>(&self, input: &'a str) -> Cow<'a, str> {
        match self {
            Self::Lowercase => {
                if input.chars().any(|c| c.is_uppercase()) {
                    Cow::Owned(input.to_lowercase())
                } else {
                    Cow::Borrowed(input)
                }
            },
            Self::UrlDecode => {
                let decoded = recursive_unescape(input);
                if decoded == input {
                    Cow::Borrowed(input)
                } else {
                    Cow::Owned(decoded)
                }
            },
            Self::Trim => {
                let trimmed = input.trim();
                if trimmed.len() == input.len() {
                    Cow::Borrowed(input)
                } else {
                    Cow::Owned(trimmed.to_string())
                }
            },
        }
    }
}

/// Apply a transformation chain in order.
pub fn apply_transforms<'a>(transforms: &[Transform], input: &'a str) -> Cow<'a, str> {
    let mut owned: Option<String> = None;
    for transform in transforms {
        let current = owned.as_deref().unwrap_or(input);
        if let Cow::Owned(new) = transform.apply(current) {
            owned = Some(new);
        }
    }
    match owned {
        Some(s) => Cow::Owned(s),
        None => Cow::Borrowed(input),
    }
}

/// A rule record as serialized in rule-definition files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique rule id
    pub id: String,

    /// Human-readable message
    #[serde(default)]
    pub name: String,

    /// CRS variable expression (`ARGS|REQUEST_HEADERS:User-Agent|...`)
    pub variable: String,

    /// Raw regex source
    pub regex: String,

    /// Inspection phase: 1 (headers, URI, args) or 2 (body)
    #[serde(default = "default_phase")]
    pub phase: u8,

    /// Severity tag
    #[serde(default)]
    pub severity: Severity,

    /// Whether a match blocks the request
    #[serde(default)]
    pub block: bool,

    /// Transformation tags, applied in order before matching
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<String>,

    /// CRS tags, carried through to logs only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Paranoia level metadata
    #[serde(default, skip_serializing_if = "is_zero")]
    pub paranoia_level: u32,

    /// `ctl:` actions, carried through but unused by the decision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<String>,

    /// Chained sub-rules; the rule fires only when every sub-rule also
    /// matches some candidate of its own variable expression
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<RuleSpec>,
}

fn default_phase() -> u8 {
    1
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// A compiled rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Source record
    pub spec: RuleSpec,

    /// Compiled pattern; absent means the rule is skipped at
    /// evaluation time
    pub compiled: Option<Arc<Regex>>,

    /// Parsed transformation chain
    pub transforms: Vec<Transform>,

    /// Compiled chain links
    pub chain: Vec<Rule>,
}

impl Rule {
    /// Compile a rule spec, validating its invariants.
    ///
    /// Rejects empty ids, variables and patterns and phases outside
    /// {1, 2}; the loader logs and skips rejected rules.
    pub fn compile(spec: RuleSpec, cache: &PatternCache) -> WafResult<Self> {
        if spec.id.trim().is_empty() {
            return Err(WafError::Load("rule with empty id".to_string()));
        }
        if spec.variable.trim().is_empty() {
            return Err(WafError::Load(format!("rule {}: empty variable", spec.id)));
        }
        if spec.regex.trim().is_empty() {
            return Err(WafError::Load(format!("rule {}: empty pattern", spec.id)));
        }
        if !matches!(spec.phase, 1 | 2) {
            return Err(WafError::Load(format!(
                "rule {}: phase {} outside 1..=2",
                spec.id, spec.phase
            )));
        }

        let compiled = cache.get_or_compile(&spec.regex)?;
        let transforms = spec
            .transforms
            .iter()
            .filter_map(|t| Transform::parse(t))
            .collect();

        let chain = spec
            .chain
            .iter()
            .cloned()
            .map(|mut link| {
                // Chain links inherit the parent id for diagnostics.
                if link.id.trim().is_empty() {
                    link.id = format!("{}-chain", spec.id);
                }
                Rule::compile(link, cache)
            })
            .collect::<WafResult<Vec<_>>>()?;

        Ok(Self {
            spec,
            compiled: Some(compiled),
            transforms,
            chain,
        })
    }

    /// Test a candidate value against this rule's pattern, applying the
    /// transformation chain first.
    pub fn matches(&self, candidate: &str) -> bool {
        let Some(re) = &self.compiled else {
            return false;
        };
        let value = apply_transforms(&self.transforms, candidate);
        re.is_match(&value)
    }
}

/// An ordered collection of compiled rules.
///
/// Order is load order: files sorted lexicographically by path, rules
/// in document order within a file. Duplicate ids are rejected.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    ids: HashSet<String>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule, rejecting duplicate ids.
    pub fn add(&mut self, rule: Rule) -> WafResult<()> {
        if !self.ids.insert(rule.spec.id.clone()) {
            return Err(WafError::Load(format!(
                "duplicate rule id {}",
                rule.spec.id
            )));
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Rules in load order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Rules of a given phase, preserving load order.
    pub fn phase(&self, phase: u8) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |r| r.spec.phase == phase)
    }

    /// Lookup by id.
    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.spec.id == id)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, variable: &str, regex: &str) -> RuleSpec {
        RuleSpec {
            id: id.to_string(),
            name: format!("rule {id}"),
            variable: variable.to_string(),
            regex: regex.to_string(),
            phase: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse("critical"), Severity::Critical);
        assert_eq!(Severity::parse("Warning"), Severity::Warning);
        assert_eq!(Severity::parse("bogus"), Severity::Notice);
        assert_eq!(Severity::parse(""), Severity::Notice);
    }

    #[test]
    fn test_transform_parse_unknown_ignored() {
        assert_eq!(Transform::parse("lowercase"), Some(Transform::Lowercase));
        assert_eq!(Transform::parse("urlDecode"), Some(Transform::UrlDecode));
        assert_eq!(Transform::parse("trim"), Some(Transform::Trim));
        assert_eq!(Transform::parse("removeNulls"), None);
    }

    #[test]
    fn test_transform_apply() {
        assert_eq!(Transform::Lowercase.apply("AbC"), "abc");
        assert_eq!(Transform::UrlDecode.apply("a%20b"), "a b");
        assert_eq!(Transform::Trim.apply("  x  "), "x");
        // No-op transforms borrow
        assert!(matches!(
            Transform::Lowercase.apply("abc"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_apply_transforms_order() {
        let chain = vec![Transform::Trim, Transform::Lowercase];
        assert_eq!(apply_transforms(&chain, "  SELECT  "), "select");
    }

    #[test]
    fn test_rule_compile_and_match() {
        let cache = PatternCache::new();
        let rule = Rule::compile(spec("1", "ARGS", r"or\s+1=1"), &cache).unwrap();
        assert!(rule.matches("1' OR 1=1--"));
        assert!(!rule.matches("hello"));
    }

    #[test]
    fn test_rule_compile_rejects_invalid() {
        let cache = PatternCache::new();
        assert!(Rule::compile(spec("", "ARGS", "x"), &cache).is_err());
        assert!(Rule::compile(spec("1", "", "x"), &cache).is_err());
        assert!(Rule::compile(spec("1", "ARGS", ""), &cache).is_err());
        assert!(Rule::compile(spec("1", "ARGS", "(bad"), &cache).is_err());

        let mut bad_phase = spec("1", "ARGS", "x");
        bad_phase.phase = 3;
        assert!(Rule::compile(bad_phase, &cache).is_err());
    }

    #[test]
    fn test_rule_with_transforms() {
        let cache = PatternCache::new();
        let mut s = spec("1", "ARGS", "drop table");
        s.transforms = vec![
            "lowercase".to_string(),
            "urlDecode".to_string(),
            "unknownTag".to_string(),
        ];
        let rule = Rule::compile(s, &cache).unwrap();
        assert_eq!(rule.transforms.len(), 2);
        assert!(rule.matches("DROP%20TABLE users"));
    }

    #[test]
    fn test_chain_compilation() {
        let cache = PatternCache::new();
        let mut outer = spec("10", "ARGS", "union");
        outer.chain = vec![spec("", "REQUEST_URI", "/admin")];
        let rule = Rule::compile(outer, &cache).unwrap();
        assert_eq!(rule.chain.len(), 1);
        assert_eq!(rule.chain[0].spec.id, "10-chain");
    }

    #[test]
    fn test_ruleset_duplicate_rejected() {
        let cache = PatternCache::new();
        let mut set = RuleSet::new();
        set.add(Rule::compile(spec("1", "ARGS", "a"), &cache).unwrap())
            .unwrap();
        let dup = Rule::compile(spec("1", "ARGS", "b"), &cache).unwrap();
        assert!(set.add(dup).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ruleset_phase_partition() {
        let cache = PatternCache::new();
        let mut set = RuleSet::new();
        let mut p2 = spec("2", "REQUEST_BODY", "b");
        p2.phase = 2;
        set.add(Rule::compile(spec("1", "ARGS", "a"), &cache).unwrap())
            .unwrap();
        set.add(Rule::compile(p2, &cache).unwrap()).unwrap();

        let phase1: Vec<_> = set.phase(1).map(|r| r.spec.id.as_str()).collect();
        let phase2: Vec<_> = set.phase(2).map(|r| r.spec.id.as_str()).collect();
        assert_eq!(phase1, ["1"]);
        assert_eq!(phase2, ["2"]);
    }

    #[test]
    fn test_spec_toml_round_trip() {
        let toml_src = r#"
            [[rule]]
            id = "942100"
            name = "SQL Injection Attack"
            variable = "ARGS|REQUEST_BODY"
            regex = "(?i)or\\s+1=1"
            phase = 1
            severity = "CRITICAL"
            block = true
            transforms = ["lowercase"]
            tags = ["attack-sqli"]
            paranoia_level = 1
        "#;

        #[derive(Deserialize)]
        struct File {
            rule: Vec<RuleSpec>,
        }

        let file: File = toml::from_str(toml_src).unwrap();
        assert_eq!(file.rule.len(), 1);
        let spec = &file.rule[0];
        assert_eq!(spec.id, "942100");
        assert_eq!(spec.severity, Severity::Critical);
        assert!(spec.block);
        assert_eq!(spec.transforms, ["lowercase"]);
    }
}
