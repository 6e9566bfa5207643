//! The rule evaluator
//!
//! [`Engine`] owns the shared rule set, the pattern cache and the match
//! logger; one instance is built at startup and handed to the HTTP
//! service. Evaluation walks rules in load order (phase 1 before
//! phase 2), fires each rule at most once, accumulates the anomaly
//! score and keeps evaluating after a block so the log carries every
//! match.

use crate::cache::PatternCache;
use crate::config::EngineConfig;
use crate::error::WafResult;
use crate::expand::expand_with_terms;
use crate::logging::{MatchLogger, MatchRecord};
use crate::request::Request;
use crate::rules::{Rule, RuleLoader, RuleSet, SharedRuleSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    /// Final blocking decision
    pub block: bool,

    /// Anomaly score, one point per fired rule
    pub score: u32,

    /// Fired rules with CRITICAL severity
    pub critical_score: u32,

    /// Fired rules in (phase, rule, candidate) order
    pub matches: Vec<MatchRecord>,
}

impl Decision {
    /// Verdict string for the JSON response.
    pub fn verdict(&self) -> &'static str {
        if self.block {
            "block"
        } else {
            "allow"
        }
    }
}

/// Engine counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Requests evaluated
    pub requests_evaluated: AtomicU64,
    /// Requests that ended blocked
    pub requests_blocked: AtomicU64,
    /// Requests that ended allowed
    pub requests_allowed: AtomicU64,
    /// Total rule firings
    pub rules_fired: AtomicU64,
    /// Internal evaluation failures (verdict fell back to policy)
    pub eval_errors: AtomicU64,
    /// Cumulative evaluation time in microseconds
    pub total_eval_time_us: AtomicU64,
}

impl EngineStats {
    fn record(&self, decision: &Decision, elapsed_us: u64) {
        self.requests_evaluated.fetch_add(1, Ordering::Relaxed);
        if decision.block {
            self.requests_blocked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_allowed.fetch_add(1, Ordering::Relaxed);
        }
        self.rules_fired
            .fetch_add(decision.matches.len() as u64, Ordering::Relaxed);
        self.total_eval_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
    }

    /// Average evaluation time in microseconds.
    pub fn avg_eval_time_us(&self) -> u64 {
        let evaluated = self.requests_evaluated.load(Ordering::Relaxed);
        if evaluated == 0 {
            0
        } else {
            self.total_eval_time_us.load(Ordering::Relaxed) / evaluated
        }
    }
}

/// The inspection engine handle.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<PatternCache>,
    loader: RuleLoader,
    ruleset: SharedRuleSet,
    logger: MatchLogger,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("rules", &self.rule_count())
            .field("mode", &self.config.mode)
            .finish()
    }
}

impl Engine {
    /// Build an engine from configuration, loading the rule directory.
    ///
    /// Fails only when the rule directory itself cannot be read; bad
    /// files and bad rules inside it are skipped with warnings.
    pub fn new(config: EngineConfig) -> WafResult<Self> {
        let cache = Arc::new(PatternCache::new());
        let loader = RuleLoader::new(&config.rules_dir, Arc::clone(&cache));
        let set = loader.load()?;
        let logger = MatchLogger::new(config.log_path.as_deref());

        info!(rules = set.len(), mode = ?config.mode, "engine ready");
        Ok(Self {
            config,
            cache,
            loader,
            ruleset: SharedRuleSet::from_set(set),
            logger,
            stats: Arc::new(EngineStats::default()),
        })
    }

    /// Build an engine over an already-compiled rule set, with an
    /// in-memory match log. Used by tests and embedders.
    pub fn with_ruleset(config: EngineConfig, cache: Arc<PatternCache>, set: RuleSet) -> Self {
        let loader = RuleLoader::new(&config.rules_dir, Arc::clone(&cache));
        Self {
            config,
            cache,
            loader,
            ruleset: SharedRuleSet::from_set(set),
            logger: MatchLogger::in_memory(),
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Match logger.
    pub fn logger(&self) -> &MatchLogger {
        &self.logger
    }

    /// Counters.
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Rules in the current snapshot.
    pub fn rule_count(&self) -> usize {
        self.ruleset.current().len()
    }

    /// Reload the rule directory and swap the shared set.
    ///
    /// The pattern cache is flushed before loading so no stale compiled
    /// pattern survives; in-flight evaluations keep the old snapshot
    /// until they finish.
    pub fn reload(&self) -> WafResult<usize> {
        self.cache.flush();
        let set = self.loader.load()?;
        let count = set.len();
        self.ruleset.store(set);
        info!(rules = count, "rule set reloaded");
        Ok(count)
    }

    /// Evaluate a request and return the decision.
    pub fn evaluate(&self, req: &Request) -> Decision {
        let ruleset = self.ruleset.current();
        let mut decision = Decision::default();

        for phase in [1u8, 2] {
            for rule in ruleset.phase(phase) {
                self.evaluate_rule(rule, req, &mut decision);
            }
        }

        if decision.critical_score >= self.config.critical_threshold {
            debug!(
                critical_score = decision.critical_score,
                threshold = self.config.critical_threshold,
                "critical threshold reached"
            );
            decision.block = true;
        }

        if !self.config.mode.should_block() {
            decision.block = false;
        }

        decision
    }

    /// Evaluate one rule, firing at most once.
    fn evaluate_rule(&self, rule: &Rule, req: &Request, decision: &mut Decision) {
        if rule.compiled.is_none() {
            return;
        }

        let Some((term, value)) = first_match(rule, req) else {
            return;
        };

        // Chained rules fire only when every link also matches some
        // candidate of its own expansion.
        if !rule.chain.iter().all(|link| link_matches(link, req)) {
            return;
        }

        decision.score += 1;
        if rule.spec.severity == crate::rules::Severity::Critical {
            decision.critical_score += 1;
        }
        if rule.spec.block {
            decision.block = true;
        }
        decision.matches.push(MatchRecord {
            rule_id: rule.spec.id.clone(),
            rule_name: rule.spec.name.clone(),
            variable: term,
            value,
            block: rule.spec.block,
        });
    }

    /// Evaluate, update counters and emit the per-request log record.
    pub fn inspect(&self, client_ip: &str, req: &Request) -> Decision {
        let start = Instant::now();
        let decision = self.evaluate(req);
        self.stats
            .record(&decision, start.elapsed().as_micros() as u64);

        self.logger.log_request(
            client_ip,
            &req.method,
            &req.path,
            &decision.matches,
            decision.score,
            decision.block,
        );
        decision
    }

    /// Count an internal failure and produce the policy verdict.
    pub fn failure_decision(&self) -> Decision {
        self.stats.eval_errors.fetch_add(1, Ordering::Relaxed);
        Decision {
            block: self.config.fail_closed,
            ..Default::default()
        }
    }
}

/// First matching (term, candidate) for a rule, in term then candidate
/// order. Empty candidates are skipped.
fn first_match(rule: &Rule, req: &Request) -> Option<(String, String)> {
    for (term, candidates) in expand_with_terms(&rule.spec.variable, req) {
        for candidate in candidates {
            if candidate.is_empty() {
                continue;
            }
            if rule.matches(&candidate) {
                return Some((term, candidate));
            }
        }
    }
    None
}

/// Whether a chain link matches any candidate of its own expansion.
fn link_matches(link: &Rule, req: &Request) -> bool {
    link.compiled.is_some() && first_match(link, req).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSpec;

    fn engine_with(specs: Vec<RuleSpec>) -> Engine {
        let cache = Arc::new(PatternCache::new());
        let mut set = RuleSet::new();
        for spec in specs {
            set.add(Rule::compile(spec, &cache).unwrap()).unwrap();
        }
        Engine::with_ruleset(EngineConfig::default(), cache, set)
    }

    fn rule(id: &str, variable: &str, regex: &str) -> RuleSpec {
        RuleSpec {
            id: id.to_string(),
            name: format!("rule {id}"),
            variable: variable.to_string(),
            regex: regex.to_string(),
            phase: 1,
            ..Default::default()
        }
    }

    fn blocking_critical(id: &str, variable: &str, regex: &str) -> RuleSpec {
        RuleSpec {
            severity: crate::rules::Severity::Critical,
            block: true,
            ..rule(id, variable, regex)
        }
    }

    #[test]
    fn test_clean_request_allows() {
        let engine = engine_with(vec![blocking_critical("1", "ARGS", "attack")]);
        let req = Request::from_http("GET", "/healthz", &[], b"");
        let decision = engine.evaluate(&req);

        assert!(!decision.block);
        assert_eq!(decision.score, 0);
        assert!(decision.matches.is_empty());
    }

    #[test]
    fn test_sqli_in_query_blocks() {
        let engine = engine_with(vec![blocking_critical("942100", "ARGS", r"(?i)or\s+1=1")]);
        let req = Request::from_http("GET", "/search?q=1%27%20OR%201%3D1--", &[], b"");
        let decision = engine.evaluate(&req);

        assert!(decision.block);
        assert_eq!(decision.score, 1);
        assert_eq!(decision.matches.len(), 1);
        assert_eq!(decision.matches[0].rule_id, "942100");
        assert_eq!(decision.matches[0].variable, "ARGS");
    }

    #[test]
    fn test_at_most_once_per_rule() {
        // Both query values match; the rule still fires once.
        let engine = engine_with(vec![rule("1", "ARGS", "x")]);
        let req = Request::from_http("GET", "/?a=x1&b=x2", &[], b"");
        let decision = engine.evaluate(&req);

        assert_eq!(decision.score, 1);
        assert_eq!(decision.matches.len(), 1);
        assert_eq!(decision.matches[0].value, "x1");
    }

    #[test]
    fn test_block_is_sticky() {
        let engine = engine_with(vec![
            blocking_critical("1", "ARGS", "evil"),
            rule("2", "ARGS", "harmless"),
        ]);
        let req = Request::from_http("GET", "/?a=evil&b=harmless", &[], b"");
        let decision = engine.evaluate(&req);

        // The non-block rule after the block rule is still evaluated
        // and logged; the decision stays blocked.
        assert!(decision.block);
        assert_eq!(decision.score, 2);
        assert_eq!(decision.matches.len(), 2);
    }

    #[test]
    fn test_critical_threshold_forces_block() {
        // Five critical rules without the block action.
        let specs: Vec<RuleSpec> = (1..=5)
            .map(|i| RuleSpec {
                severity: crate::rules::Severity::Critical,
                ..rule(&i.to_string(), &format!("ARGS:p{i}"), "payload")
            })
            .collect();
        let engine = engine_with(specs);

        let req = Request::from_http(
            "GET",
            "/?p1=payload&p2=payload&p3=payload&p4=payload&p5=payload",
            &[],
            b"",
        );
        let decision = engine.evaluate(&req);

        assert_eq!(decision.score, 5);
        assert_eq!(decision.critical_score, 5);
        assert!(decision.block);
    }

    #[test]
    fn test_below_threshold_no_block() {
        let specs: Vec<RuleSpec> = (1..=4)
            .map(|i| RuleSpec {
                severity: crate::rules::Severity::Critical,
                ..rule(&i.to_string(), &format!("ARGS:p{i}"), "payload")
            })
            .collect();
        let engine = engine_with(specs);

        let req = Request::from_http(
            "GET",
            "/?p1=payload&p2=payload&p3=payload&p4=payload",
            &[],
            b"",
        );
        let decision = engine.evaluate(&req);
        assert_eq!(decision.critical_score, 4);
        assert!(!decision.block);
    }

    #[test]
    fn test_score_equals_match_count() {
        let engine = engine_with(vec![
            rule("1", "ARGS", "x"),
            rule("2", "ARGS", "y"),
            rule("3", "ARGS", "never"),
        ]);
        let req = Request::from_http("GET", "/?a=x&b=y", &[], b"");
        let decision = engine.evaluate(&req);

        assert_eq!(decision.score as usize, decision.matches.len());
        assert!(decision.critical_score <= decision.score);
    }

    #[test]
    fn test_phase_order() {
        let mut body_rule = rule("2-body", "REQUEST_BODY", "beta");
        body_rule.phase = 2;
        let engine = engine_with(vec![body_rule, rule("1-args", "ARGS", "alpha")]);

        let req = Request::from_http(
            "POST",
            "/?a=alpha",
            &[(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )],
            br#"{"k":"beta"}"#,
        );
        let decision = engine.evaluate(&req);

        // Phase 1 match is logged before the phase 2 match even though
        // the body rule loads first.
        let ids: Vec<_> = decision.matches.iter().map(|m| m.rule_id.as_str()).collect();
        assert_eq!(ids, ["1-args", "2-body"]);
    }

    #[test]
    fn test_chained_rule_requires_all_links() {
        let mut chained = blocking_critical("10", "ARGS", "union");
        chained.chain = vec![rule("", "REQUEST_URI", "/admin")];
        let engine = engine_with(vec![chained]);

        // Outer matches, link does not
        let req = Request::from_http("GET", "/public?q=union", &[], b"");
        assert!(engine.evaluate(&req).matches.is_empty());

        // Both match: fires once
        let req = Request::from_http("GET", "/admin?q=union", &[], b"");
        let decision = engine.evaluate(&req);
        assert_eq!(decision.score, 1);
        assert!(decision.block);
        assert_eq!(decision.matches[0].rule_id, "10");
    }

    #[test]
    fn test_detect_mode_never_blocks() {
        let cache = Arc::new(PatternCache::new());
        let mut set = RuleSet::new();
        set.add(Rule::compile(blocking_critical("1", "ARGS", "evil"), &cache).unwrap())
            .unwrap();
        let config = EngineConfig {
            mode: crate::config::Mode::Detect,
            ..Default::default()
        };
        let engine = Engine::with_ruleset(config, cache, set);

        let req = Request::from_http("GET", "/?a=evil", &[], b"");
        let decision = engine.evaluate(&req);
        assert!(!decision.block);
        assert_eq!(decision.score, 1);
    }

    #[test]
    fn test_inspect_logs_and_counts() {
        let engine = engine_with(vec![blocking_critical("1", "ARGS", "evil")]);
        let req = Request::from_http("GET", "/?a=evil", &[], b"");
        let decision = engine.inspect("10.0.0.1", &req);

        assert!(decision.block);
        assert_eq!(engine.logger().count(), 1);
        assert_eq!(
            engine.stats().requests_blocked.load(Ordering::Relaxed),
            1
        );
        let recent = engine.logger().recent(1);
        assert_eq!(recent[0].matched_rules[0].rule_id, "1");
    }

    #[test]
    fn test_failure_decision_policy() {
        let engine = engine_with(vec![]);
        assert!(!engine.failure_decision().block);
        assert_eq!(engine.stats().eval_errors.load(Ordering::Relaxed), 1);

        let cache = Arc::new(PatternCache::new());
        let config = EngineConfig {
            fail_closed: true,
            ..Default::default()
        };
        let engine = Engine::with_ruleset(config, cache, RuleSet::new());
        assert!(engine.failure_decision().block);
    }

    #[test]
    fn test_fullwidth_homoglyph_blocked() {
        let engine = engine_with(vec![blocking_critical("941100", "ARGS", "(?i)<script")]);
        // Full-width <script> percent-encoded in the query
        let req = Request::from_http("GET", "/?q=%EF%BC%9Cscript%EF%BC%9E", &[], b"");
        let decision = engine.evaluate(&req);
        assert!(decision.block);
    }

    #[test]
    fn test_malformed_json_salvage_fires() {
        let mut body_rule = blocking_critical("942100", "ARGS|REQUEST_BODY", r"(?i)or\s+1=1");
        body_rule.phase = 2;
        let engine = engine_with(vec![body_rule]);

        let req = Request::from_http(
            "POST",
            "/",
            &[(
                "Content-Type".to_string(),
                "application/json".to_string(),
            )],
            br#"{"user":"admin' OR 1=1""#,
        );
        let decision = engine.evaluate(&req);
        assert!(decision.block);
        assert_eq!(decision.matches[0].variable, "REQUEST_BODY");
    }
}
