//! Structured match logging
//!
//! Every inspected request produces one JSON record, matched or not.
//! Records are buffered in a bounded in-memory ring for introspection
//! and, when a sink file is configured, handed to a dedicated writer
//! thread over an unbounded channel. A slow or failing sink never
//! delays the verdict; write failures are counted, not surfaced.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, RwLock};
use tracing::warn;

/// Default capacity of the in-memory record ring.
const DEFAULT_MAX_RECENT: usize = 1024;

/// A single fired rule, as accumulated by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Rule id
    pub rule_id: String,
    /// Rule message
    pub rule_name: String,
    /// Variable term the candidate came from
    pub variable: String,
    /// The candidate value that matched
    pub value: String,
    /// Whether the rule carries the block action
    pub block: bool,
}

impl MatchRecord {
    /// Log description, `"<Blocked|Detected> by rule <id>: <name> in
    /// <variable>"`.
    pub fn description(&self) -> String {
        let verb = if self.block { "Blocked" } else { "Detected" };
        format!(
            "{verb} by rule {}: {} in {}",
            self.rule_id, self.rule_name, self.variable
        )
    }
}

/// Matched-rule summary embedded in the per-request record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSummary {
    /// Rule id
    pub rule_id: String,
    /// Whether the rule blocks
    pub block: bool,
    /// Human-readable description
    pub description: String,
}

impl From<&MatchRecord> for MatchSummary {
    fn from(m: &MatchRecord) -> Self {
        Self {
            rule_id: m.rule_id.clone(),
            block: m.block,
            description: m.description(),
        }
    }
}

/// One structured record per inspected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// Client address as reported by the listener
    pub client_ip: String,
    /// HTTP method
    pub method: String,
    /// Request URI
    pub uri: String,
    /// Rules that fired
    pub matched_rules: Vec<MatchSummary>,
    /// Anomaly score
    pub total_score: u32,
    /// Final decision
    pub blocked: bool,
}

/// Match-log sink.
///
/// `log_request` is cheap and non-blocking: it appends to the ring and
/// enqueues the serialized line for the writer thread.
#[derive(Debug)]
pub struct MatchLogger {
    sink: Option<mpsc::Sender<String>>,
    recent: RwLock<VecDeque<RequestLog>>,
    max_recent: usize,
    write_errors: Arc<AtomicU64>,
}

impl MatchLogger {
    /// Create a logger writing to `path`, or in-memory only when
    /// `path` is `None`.
    pub fn new(path: Option<&str>) -> Self {
        let write_errors = Arc::new(AtomicU64::new(0));
        let sink = path.and_then(|p| spawn_writer(p, Arc::clone(&write_errors)));
        Self {
            sink,
            recent: RwLock::new(VecDeque::new()),
            max_recent: DEFAULT_MAX_RECENT,
            write_errors,
        }
    }

    /// In-memory logger for tests and detect-only deployments.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Record one inspected request.
    pub fn log_request(
        &self,
        client_ip: &str,
        method: &str,
        uri: &str,
        matches: &[MatchRecord],
        total_score: u32,
        blocked: bool,
    ) {
        let record = RequestLog {
            timestamp: Utc::now().to_rfc3339(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            uri: uri.to_string(),
            matched_rules: matches.iter().map(MatchSummary::from).collect(),
            total_score,
            blocked,
        };

        if let Some(sink) = &self.sink {
            match serde_json::to_string(&record) {
                Ok(line) => {
                    if sink.send(line).is_err() {
                        self.write_errors.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Err(e) => {
                    warn!("could not serialize request log: {e}");
                    self.write_errors.fetch_add(1, Ordering::Relaxed);
                },
            }
        }

        let mut recent = self.recent.write().unwrap_or_else(|e| e.into_inner());
        while recent.len() >= self.max_recent {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, count: usize) -> Vec<RequestLog> {
        self.recent
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    /// Number of buffered records.
    pub fn count(&self) -> usize {
        self.recent.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sink failures observed so far.
    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }
}

/// Spawn the single writer thread for a sink file.
///
/// Returns `None` when the file cannot be opened; the engine keeps
/// running with the in-memory ring only.
fn spawn_writer(path: &str, write_errors: Arc<AtomicU64>) -> Option<mpsc::Sender<String>> {
    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
    {
        Ok(file) => file,
        Err(e) => {
            warn!(path, "could not open match-log sink: {e}");
            return None;
        },
    };

    let (tx, rx) = mpsc::channel::<String>();
    std::thread::Builder::new()
        .name("rampart-log-writer".to_string())
        .spawn(move || {
            let mut file = file;
            for line in rx {
                if writeln!(file, "{line}").is_err() {
                    write_errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
        .ok()?;

    Some(tx)
}
