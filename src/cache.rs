//! Shared compiled-pattern cache
//!
//! Rule patterns are compiled once per distinct source string and shared
//! by reference across the ruleset. The cache is flushed before a new
//! ruleset is published so stale patterns cannot survive a reload.

use crate::error::{WafError, WafResult};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe map of pattern source to compiled regex.
///
/// Lookups take a read lock; the write lock is held only while inserting
/// a freshly compiled pattern. Patterns are compiled case-insensitive
/// and multi-line, matching CRS expectations.
#[derive(Debug, Default)]
pub struct PatternCache {
    patterns: RwLock<HashMap<String, Arc<Regex>>>,
}

impl PatternCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the compiled form of `pattern`, compiling on first sight.
    ///
    /// On compile failure nothing is inserted and the error is returned;
    /// a later call with the same pattern will retry.
    pub fn get_or_compile(&self, pattern: &str) -> WafResult<Arc<Regex>> {
        if let Some(re) = self
            .patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pattern)
        {
            return Ok(Arc::clone(re));
        }

        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map_err(|e| WafError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        let compiled = Arc::new(compiled);

        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        // Another thread may have compiled the same pattern meanwhile;
        // keep the first entry so all rules share one instance.
        let entry = patterns
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::clone(&compiled));
        Ok(Arc::clone(entry))
    }

    /// Drop every cached pattern.
    ///
    /// Sequenced before a new ruleset is published on reload.
    pub fn flush(&self) {
        self.patterns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Number of distinct cached patterns.
    pub fn len(&self) -> usize {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
