//! Rule-definition directory loader
//!
//! Reads every `.toml` rule file under the configured directory into a
//! fresh [`RuleSet`]. Files that fail to parse are skipped with a
//! warning (all-or-nothing per file), as are individual rules whose
//! pattern will not compile; only an unreadable directory is fatal.

use super::model::{Rule, RuleSet, RuleSpec};
use crate::cache::PatternCache;
use crate::error::{WafError, WafResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Index file emitted by the CRS converter; not itself a rule file.
const INDEX_FILE: &str = "ruleset_config.toml";

/// On-disk rule file shape: a sequence of `[[rule]]` tables.
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rule: Vec<RuleSpec>,
}

/// Loads rule definitions from a directory.
#[derive(Debug, Clone)]
pub struct RuleLoader {
    dir: PathBuf,
    cache: Arc<PatternCache>,
}

impl RuleLoader {
    /// Create a loader for `dir`, compiling through `cache`.
    pub fn new(dir: impl Into<PathBuf>, cache: Arc<PatternCache>) -> Self {
        Self {
            dir: dir.into(),
            cache,
        }
    }

    /// The rule directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every rule file into a fresh set.
    ///
    /// File order is lexicographic by path; rules keep document order
    /// within a file. Returns an error only when the directory itself
    /// cannot be read.
    pub fn load(&self) -> WafResult<RuleSet> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            WafError::Load(format!("rule directory {}: {e}", self.dir.display()))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension().is_some_and(|ext| ext == "toml")
                    && path.file_name().is_some_and(|name| name != INDEX_FILE)
            })
            .collect();
        paths.sort();

        let mut set = RuleSet::new();
        for path in &paths {
            self.load_file(path, &mut set);
        }

        info!(
            rules = set.len(),
            files = paths.len(),
            dir = %self.dir.display(),
            "loaded rule set"
        );
        Ok(set)
    }

    /// Load a single file into `set`, skipping on any per-file error.
    fn load_file(&self, path: &Path, set: &mut RuleSet) {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path.display(), "could not read rule file: {e}");
                return;
            },
        };

        let file: RuleFile = match toml::from_str(&data) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), "could not parse rule file: {e}");
                return;
            },
        };

        let mut loaded = 0usize;
        for spec in file.rule {
            let id = spec.id.clone();
            match Rule::compile(spec, &self.cache) {
                Ok(rule) => match set.add(rule) {
                    Ok(()) => loaded += 1,
                    Err(e) => warn!(path = %path.display(), "skipping rule {id}: {e}"),
                },
                Err(e) => warn!(path = %path.display(), "skipping rule {id}: {e}"),
            }
        }
        debug!(path = %path.display(), rules = loaded, "loaded rule file");
    }
}

/// Process-wide rule set handle.
///
/// Readers take a cheap `Arc` clone of the current snapshot; in-flight
/// evaluations keep their snapshot alive until they finish. Reload
/// builds the replacement off to the side and swaps the pointer, so a
/// reader sees either the old set or the new one, never a mixture.
#[derive(Debug, Default)]
pub struct SharedRuleSet {
    current: RwLock<Arc<RuleSet>>,
}

impl SharedRuleSet {
    /// Create a handle holding an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handle from an initial set.
    pub fn from_set(set: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// Snapshot the current rule set.
    pub fn current(&self) -> Arc<RuleSet> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Publish a replacement set.
    pub fn store(&self, set: RuleSet) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_rules(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    const VALID: &str = r#"
        [[rule]]
        id = "942100"
        name = "SQLi"
        variable = "ARGS"
        regex = "(?i)or\\s+1=1"
        severity = "CRITICAL"
        block = true
    "#;

    #[test]
    fn test_load_directory() {
        let dir = tempdir().unwrap();
        write_rules(dir.path(), "rules_sqli.toml", VALID);

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("942100").is_some());
    }

    #[test]
    fn test_load_order_is_lexicographic() {
        let dir = tempdir().unwrap();
        write_rules(
            dir.path(),
            "b.toml",
            "[[rule]]\nid = \"2\"\nvariable = \"ARGS\"\nregex = \"b\"\n",
        );
        write_rules(
            dir.path(),
            "a.toml",
            "[[rule]]\nid = \"1\"\nvariable = \"ARGS\"\nregex = \"a\"\n",
        );

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        let ids: Vec<_> = set.rules().iter().map(|r| r.spec.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn test_malformed_file_skipped() {
        let dir = tempdir().unwrap();
        write_rules(dir.path(), "bad.toml", "not [valid toml");
        write_rules(dir.path(), "good.toml", VALID);

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_bad_pattern_skipped() {
        let dir = tempdir().unwrap();
        write_rules(
            dir.path(),
            "rules.toml",
            r#"
            [[rule]]
            id = "1"
            variable = "ARGS"
            regex = "(unclosed"

            [[rule]]
            id = "2"
            variable = "ARGS"
            regex = "fine"
            "#,
        );

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.get("2").is_some());
    }

    #[test]
    fn test_duplicate_id_across_files_skipped() {
        let dir = tempdir().unwrap();
        write_rules(dir.path(), "a.toml", VALID);
        write_rules(dir.path(), "b.toml", VALID);

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_index_file_ignored() {
        let dir = tempdir().unwrap();
        write_rules(dir.path(), "rules.toml", VALID);
        write_rules(
            dir.path(),
            INDEX_FILE,
            "load_rules = [\"rules.toml\"]\n",
        );

        let loader = RuleLoader::new(dir.path(), Arc::new(PatternCache::new()));
        let set = loader.load().unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_missing_directory_is_error() {
        let loader = RuleLoader::new("/nonexistent/rules", Arc::new(PatternCache::new()));
        assert!(loader.load().is_err());
    }

    #[test]
    fn test_shared_ruleset_swap() {
        let cache = Arc::new(PatternCache::new());
        let dir = tempdir().unwrap();
        write_rules(dir.path(), "rules.toml", VALID);
        let loader = RuleLoader::new(dir.path(), Arc::clone(&cache));

        let shared = SharedRuleSet::from_set(loader.load().unwrap());
        let before = shared.current();
        assert_eq!(before.len(), 1);

        write_rules(
            dir.path(),
            "more.toml",
            "[[rule]]\nid = \"999\"\nvariable = \"ARGS\"\nregex = \"x\"\n",
        );
        cache.flush();
        shared.store(loader.load().unwrap());

        // The old snapshot is unchanged; the new one sees both files.
        assert_eq!(before.len(), 1);
        assert_eq!(shared.current().len(), 2);
    }
}
