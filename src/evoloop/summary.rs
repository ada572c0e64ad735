//! Session Summarizer — canonical snapshots of global state.
//!
//! A [`SessionSummary`] captures everything another agent needs to decide
//! whether it is safe to start work: git HEAD and branch, credit usage,
//! agent states, held locks, pending tasks, and leveled warnings. The
//! summary is persisted as YAML, but its integrity hash is computed over
//! the canonical JSON serialization (sorted keys, UTF-8) of every field
//! except `context_hash` itself and the free-form `extensions` block — so
//! the hash is stable across repeated serializations and unaffected by
//! extension payloads.
//!
//! ```text
//! context_hash = "sha256:" + hex(SHA-256(canonical_json(summary \ {context_hash, extensions})))
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use evoloop::config::SentinelConfig;
//! use evoloop::sentinel::CreditSentinel;
//! use evoloop::summary::SessionSummarizer;
//!
//! let sentinel = CreditSentinel::new(SentinelConfig::default());
//! let summarizer = SessionSummarizer::new("schemas/session_summary.yaml");
//! let summary = summarizer.generate_summary(&sentinel);
//! summarizer.save_summary(&summary).unwrap();
//! ```

use crate::evoloop::sentinel::{AgentStatus, CreditSentinel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Version string stamped into every summary.
pub const SUMMARY_VERSION: &str = "1.0";

/// Tooling identifier recorded in summaries.
pub const TOOLING_VERSION: &str = "evoloop-tooling-v0.1.0";

/// Session-id prefix: ids look like `evoloop-2026-08-01-001`.
pub const SESSION_PREFIX: &str = "evoloop";

/// An open pull request, as far as the summary cares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPr {
    pub number: u64,
    pub title: String,
    pub head: String,
    pub url: String,
}

/// Repository state at summary time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoState {
    pub main_sha: String,
    pub branch: String,
    pub dirty: bool,
    pub open_prs: Vec<OpenPr>,
}

/// Credit accounting. `used + remaining` always equals the global cap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreditSummary {
    pub used: u64,
    pub remaining: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_saved: Option<String>,
    pub max_per_agent: BTreeMap<String, u64>,
}

/// State of one active agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAgentState {
    pub credits: u64,
    pub wall_time_ms: u64,
    pub last_action: String,
}

/// State of one idle agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleAgentState {
    pub credits: u64,
    pub last_active: String,
}

/// Agents bucketed by status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStates {
    pub active: BTreeMap<String, ActiveAgentState>,
    pub idle: BTreeMap<String, IdleAgentState>,
    pub aborted: Vec<String>,
}

/// Held file locks: path → holder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockStates {
    pub held: BTreeMap<String, String>,
}

/// A pending roadmap task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub task: String,
    pub status: String,
}

/// Warning severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningLevel {
    Info,
    Warn,
    Error,
}

/// A leveled warning attached to the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Warning {
    pub level: WarningLevel,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Warning {
    fn new(level: WarningLevel, msg: impl Into<String>, code: &str) -> Self {
        Self {
            level,
            msg: msg.into(),
            code: Some(code.to_string()),
        }
    }
}

/// Canonical snapshot of global state, persisted as YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub build_id: String,
    pub tooling_version: String,
    pub repo: RepoState,
    pub credits: CreditSummary,
    pub agents: AgentStates,
    pub locks: LockStates,
    pub next_tasks: Vec<TaskEntry>,
    pub warnings: Vec<Warning>,
    /// Free-form extension data. Excluded from the context hash.
    #[serde(default)]
    pub extensions: Value,
    pub context_hash: String,
}

impl SessionSummary {
    /// Recompute the context hash from this summary's current contents.
    pub fn recompute_hash(&self) -> String {
        compute_context_hash(self)
    }
}

/// Compute `sha256:<hex>` over the canonical JSON form of a summary,
/// excluding `context_hash` and `extensions`.
///
/// serde_json object keys sort lexicographically, so repeated invocations
/// over identical inputs produce identical hashes.
pub fn compute_context_hash(summary: &SessionSummary) -> String {
    let mut value = serde_json::to_value(summary).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("context_hash");
        map.remove("extensions");
    }
    let canonical = value.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{:02x}", byte)).collect();
    format!("sha256:{}", hex)
}

/// Run a git command in `dir` and return trimmed stdout on success.
pub(crate) fn git_output(dir: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Generates and persists session summaries.
pub struct SessionSummarizer {
    summary_path: PathBuf,
    repo_dir: PathBuf,
    global_cap: u64,
    next_tasks: Vec<TaskEntry>,
}

impl SessionSummarizer {
    /// Create a summarizer writing to `summary_path`, probing git in the
    /// current directory, with the default global cap of 1000.
    pub fn new(summary_path: impl AsRef<Path>) -> Self {
        Self {
            summary_path: summary_path.as_ref().to_path_buf(),
            repo_dir: PathBuf::from("."),
            global_cap: 1000,
            next_tasks: Vec::new(),
        }
    }

    /// Override the global credit cap (builder pattern).
    pub fn with_global_cap(mut self, cap: u64) -> Self {
        self.global_cap = cap;
        self
    }

    /// Override the directory git commands run in (builder pattern).
    pub fn with_repo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.repo_dir = dir.into();
        self
    }

    /// Set the pending-task list recorded in summaries (builder pattern).
    pub fn with_next_tasks(mut self, tasks: Vec<TaskEntry>) -> Self {
        self.next_tasks = tasks;
        self
    }

    /// Path the summary is written to.
    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    /// Next sequence number for today's session ids, continuing from the
    /// on-disk summary when it is from the same day.
    fn next_session_number(&self, today: &str) -> u32 {
        if let Some(existing) = self.load_summary() {
            if existing.session_id.contains(today) {
                if let Some(seq) = existing
                    .session_id
                    .rsplit('-')
                    .next()
                    .and_then(|seq| seq.parse::<u32>().ok())
                {
                    return seq + 1;
                }
            }
        }
        1
    }

    fn git_info(&self) -> RepoState {
        RepoState {
            main_sha: git_output(&self.repo_dir, &["rev-parse", "HEAD"]).unwrap_or_default(),
            branch: git_output(&self.repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
                .unwrap_or_else(|| "main".to_string()),
            dirty: git_output(&self.repo_dir, &["status", "--porcelain"])
                .map(|status| !status.is_empty())
                .unwrap_or(false),
            open_prs: Vec::new(),
        }
    }

    fn credit_metrics(&self, sentinel: &CreditSentinel) -> CreditSummary {
        let snapshot = sentinel.get_metrics();
        let used = snapshot.global.total_credits;
        let checkpoint_saved = snapshot
            .agents
            .values()
            .filter_map(|metrics| metrics.last_checkpoint)
            .max()
            .map(|time| time.to_rfc3339());
        CreditSummary {
            used,
            remaining: self.global_cap.saturating_sub(used),
            checkpoint_saved,
            max_per_agent: snapshot
                .agents
                .iter()
                .map(|(name, metrics)| (name.clone(), metrics.credits_used))
                .collect(),
        }
    }

    fn agent_states(&self, sentinel: &CreditSentinel) -> AgentStates {
        let snapshot = sentinel.get_metrics();
        let mut states = AgentStates::default();
        for (name, metrics) in &snapshot.agents {
            match metrics.status {
                AgentStatus::Aborted => states.aborted.push(name.clone()),
                AgentStatus::Active => {
                    states.active.insert(
                        name.clone(),
                        ActiveAgentState {
                            credits: metrics.credits_used,
                            wall_time_ms: metrics.wall_time_ms,
                            last_action: "tool_call".to_string(),
                        },
                    );
                }
                AgentStatus::Idle => {
                    states.idle.insert(
                        name.clone(),
                        IdleAgentState {
                            credits: metrics.credits_used,
                            last_active: metrics.start_time.to_rfc3339(),
                        },
                    );
                }
            }
        }
        states.aborted.sort();
        states
    }

    fn lock_states(&self, sentinel: &CreditSentinel) -> LockStates {
        LockStates {
            held: sentinel
                .get_metrics()
                .locks
                .iter()
                .map(|(path, entry)| (path.clone(), entry.holder.clone()))
                .collect(),
        }
    }

    fn generate_warnings(&self, credits: &CreditSummary, agents: &AgentStates) -> Vec<Warning> {
        let mut warnings = Vec::new();
        let usage_pct = if self.global_cap > 0 {
            credits.used as f64 / self.global_cap as f64 * 100.0
        } else {
            0.0
        };
        if usage_pct >= 90.0 {
            warnings.push(Warning::new(
                WarningLevel::Error,
                format!("Credit usage critical: {:.1}%", usage_pct),
                "credit_limit",
            ));
        } else if usage_pct >= 80.0 {
            warnings.push(Warning::new(
                WarningLevel::Warn,
                format!("Credit usage high: {:.1}%", usage_pct),
                "credit_high",
            ));
        }
        if !agents.aborted.is_empty() {
            warnings.push(Warning::new(
                WarningLevel::Error,
                format!("Agents aborted: {}", agents.aborted.join(", ")),
                "agent_aborted",
            ));
        }
        warnings
    }

    /// Collect git state, sentinel metrics, agent states, and locks into a
    /// complete summary with its context hash.
    pub fn generate_summary(&self, sentinel: &CreditSentinel) -> SessionSummary {
        let now = Utc::now();
        let session_date = now.format("%Y-%m-%d").to_string();
        let sequence = self.next_session_number(&session_date);

        let repo = self.git_info();
        let short_sha = if repo.main_sha.len() >= 7 {
            &repo.main_sha[..7]
        } else {
            "0000000"
        };

        let credits = self.credit_metrics(sentinel);
        let agents = self.agent_states(sentinel);
        let mut warnings = self.generate_warnings(&credits, &agents);
        if repo.dirty {
            warnings.push(Warning::new(
                WarningLevel::Warn,
                "Working tree has uncommitted changes",
                "git_dirty",
            ));
        }

        let mut summary = SessionSummary {
            version: SUMMARY_VERSION.to_string(),
            timestamp: now,
            session_id: format!("{}-{}-{:03}", SESSION_PREFIX, session_date, sequence),
            build_id: format!("{}-{}", short_sha, now.timestamp()),
            tooling_version: TOOLING_VERSION.to_string(),
            repo,
            credits,
            agents,
            locks: self.lock_states(sentinel),
            next_tasks: self.next_tasks.clone(),
            warnings,
            extensions: Value::Object(serde_json::Map::new()),
            context_hash: String::new(),
        };

        // Arithmetic check: remaining must equal cap - used.
        let expected_remaining = self.global_cap.saturating_sub(summary.credits.used);
        if summary.credits.remaining != expected_remaining {
            summary.credits.remaining = expected_remaining;
            summary.warnings.push(Warning {
                level: WarningLevel::Info,
                msg: format!("Corrected credit arithmetic: {} remaining", expected_remaining),
                code: None,
            });
        }

        summary.context_hash = compute_context_hash(&summary);
        summary
    }

    /// Write a summary to the YAML summary file.
    pub fn save_summary(&self, summary: &SessionSummary) -> std::io::Result<()> {
        if let Some(parent) = self.summary_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let yaml = serde_yaml::to_string(summary)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.summary_path, yaml)
    }

    /// Load the summary file, if present and parseable.
    pub fn load_summary(&self) -> Option<SessionSummary> {
        let text = std::fs::read_to_string(&self.summary_path).ok()?;
        match serde_yaml::from_str(&text) {
            Ok(summary) => Some(summary),
            Err(err) => {
                log::warn!(
                    "failed to parse summary {}: {}",
                    self.summary_path.display(),
                    err
                );
                None
            }
        }
    }
}
