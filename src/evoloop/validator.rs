//! Context Validator — pre-flight validation for agent startup.
//!
//! Agents call [`ContextValidator::validate_context`] before beginning
//! work. A summary is rejected when it is missing, its stored hash no
//! longer matches a recomputation, git HEAD or the branch diverged from
//! what it recorded, it is older than the staleness budget, or credit
//! usage has reached 95 % of the global cap. The failure mode is a typed
//! [`ContextInvalid`] reason the caller can log and abort on.

use crate::evoloop::sentinel::CreditSentinel;
use crate::evoloop::summary::{git_output, SessionSummarizer, SessionSummary};
use chrono::Utc;
use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a session summary was rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextInvalid {
    /// No summary file exists; run the summarizer first.
    MissingSummary,
    /// Recomputed hash disagrees with the stored one; the summary may be
    /// corrupted or hand-edited.
    HashMismatch { stored: String, computed: String },
    /// Git HEAD moved since the summary was generated.
    HeadDiverged { recorded: String, current: String },
    /// The branch changed since the summary was generated.
    BranchDiverged { recorded: String, current: String },
    /// The summary is older than the staleness budget.
    Stale { age_seconds: i64, max_seconds: u64 },
    /// Credit usage is at or past 95 % of the global cap.
    CreditsExhausted { used: u64, cap: u64 },
}

impl fmt::Display for ContextInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextInvalid::MissingSummary => {
                write!(f, "no session summary found - run the summarizer first")
            }
            ContextInvalid::HashMismatch { stored, computed } => write!(
                f,
                "context hash mismatch (stored {}, computed {})",
                stored, computed
            ),
            ContextInvalid::HeadDiverged { recorded, current } => write!(
                f,
                "git HEAD changed: {} -> {}",
                &recorded[..recorded.len().min(7)],
                &current[..current.len().min(7)]
            ),
            ContextInvalid::BranchDiverged { recorded, current } => {
                write!(f, "branch changed: {} -> {}", recorded, current)
            }
            ContextInvalid::Stale {
                age_seconds,
                max_seconds,
            } => write!(
                f,
                "summary is {} s old (max {} s) - regenerate it",
                age_seconds, max_seconds
            ),
            ContextInvalid::CreditsExhausted { used, cap } => {
                write!(f, "credit limit nearly exhausted: {}/{}", used, cap)
            }
        }
    }
}

impl Error for ContextInvalid {}

/// Validates session context before agent operations.
pub struct ContextValidator {
    summary_path: PathBuf,
    repo_dir: PathBuf,
    max_staleness_seconds: u64,
    global_cap: u64,
}

impl ContextValidator {
    /// Create a validator over the given summary file with the default
    /// staleness budget (3600 s) and global cap (1000).
    pub fn new(summary_path: impl AsRef<Path>) -> Self {
        Self {
            summary_path: summary_path.as_ref().to_path_buf(),
            repo_dir: PathBuf::from("."),
            max_staleness_seconds: 3600,
            global_cap: 1000,
        }
    }

    /// Override the staleness budget (builder pattern).
    pub fn with_max_staleness(mut self, seconds: u64) -> Self {
        self.max_staleness_seconds = seconds;
        self
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

    fn summarizer(&self) -> SessionSummarizer {
        SessionSummarizer::new(&self.summary_path)
            .with_global_cap(self.global_cap)
            .with_repo_dir(self.repo_dir.clone())
    }

    /// Validate the stored summary against current reality.
    pub fn validate_context(&self) -> Result<SessionSummary, ContextInvalid> {
        let summary = self
            .summarizer()
            .load_summary()
            .ok_or(ContextInvalid::MissingSummary)?;

        let computed = summary.recompute_hash();
        if computed != summary.context_hash {
            return Err(ContextInvalid::HashMismatch {
                stored: summary.context_hash,
                computed,
            });
        }

        if let Some(current_sha) = git_output(&self.repo_dir, &["rev-parse", "HEAD"]) {
            if !summary.repo.main_sha.is_empty() && current_sha != summary.repo.main_sha {
                return Err(ContextInvalid::HeadDiverged {
                    recorded: summary.repo.main_sha,
                    current: current_sha,
                });
            }
        }

        if let Some(current_branch) = git_output(&self.repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
        {
            if current_branch != summary.repo.branch {
                return Err(ContextInvalid::BranchDiverged {
                    recorded: summary.repo.branch,
                    current: current_branch,
                });
            }
        }

        let age_seconds = (Utc::now() - summary.timestamp).num_seconds();
        if age_seconds > self.max_staleness_seconds as i64 {
            return Err(ContextInvalid::Stale {
                age_seconds,
                max_seconds: self.max_staleness_seconds,
            });
        }

        let exhaustion_floor = (self.global_cap as f64 * 0.95) as u64;
        if summary.credits.used >= exhaustion_floor {
            return Err(ContextInvalid::CreditsExhausted {
                used: summary.credits.used,
                cap: self.global_cap,
            });
        }

        Ok(summary)
    }

    /// Validate, aborting with a diagnostic on failure. The standard call
    /// for agent bootstrap.
    pub fn require_valid_context(&self, agent_name: &str) -> Result<SessionSummary, ContextInvalid> {
        match self.validate_context() {
            Ok(summary) => {
                log::info!("[{}] context validated", agent_name);
                Ok(summary)
            }
            Err(reason) => {
                log::error!("[{}] context validation failed: {}", agent_name, reason);
                Err(reason)
            }
        }
    }

    /// Validate, regenerating a fresh summary from the sentinel when the
    /// stored one is invalid or stale.
    pub fn safe_context(&self, sentinel: &CreditSentinel) -> SessionSummary {
        match self.validate_context() {
            Ok(summary) => summary,
            Err(reason) => {
                log::warn!("{}; regenerating session summary", reason);
                let summarizer = self.summarizer();
                let summary = summarizer.generate_summary(sentinel);
                if let Err(err) = summarizer.save_summary(&summary) {
                    log::error!("failed to save regenerated summary: {}", err);
                }
                summary
            }
        }
    }
}
