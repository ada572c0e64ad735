//! Meta-Analyst — post-hoc analysis of the summary and the metrics log.
//!
//! Purely read-only and never on the hot path: it loads the session
//! summary YAML plus the admission CSV, aggregates credit usage by agent
//! and by tool, scores efficiency, renders a human-readable report, and
//! decides an exit code. Critical conditions (credit usage ≥ 95 %, aborted
//! agents, or any `error`-level warning in the summary) make
//! [`MetaAnalyst::run`] return 1.

use crate::evoloop::metrics_log::{read_metrics_csv, MetricsRow};
use crate::evoloop::summary::{SessionSummarizer, SessionSummary, WarningLevel};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Aggregated findings over one session.
#[derive(Debug, Default)]
pub struct Analysis {
    pub total_credits: u64,
    pub utilization_pct: f64,
    pub credits_by_agent: BTreeMap<String, u64>,
    pub credits_by_tool: BTreeMap<String, u64>,
    /// Top consumers, highest first, at most five entries.
    pub high_consumers: Vec<(String, u64)>,
    pub verdict_counts: BTreeMap<String, u64>,
    /// Share of rows whose verdict was `allow` or `checkpoint`.
    pub efficiency_score: f64,
    pub aborted_agents: Vec<String>,
    pub warnings: Vec<String>,
    pub critical: bool,
}

/// Analyzes metrics and generates insight reports.
pub struct MetaAnalyst {
    summary_path: PathBuf,
    metrics_path: PathBuf,
    global_cap: u64,
}

impl MetaAnalyst {
    /// Create an analyst over the given summary YAML and metrics CSV.
    pub fn new(summary_path: impl AsRef<Path>, metrics_path: impl AsRef<Path>) -> Self {
        Self {
            summary_path: summary_path.as_ref().to_path_buf(),
            metrics_path: metrics_path.as_ref().to_path_buf(),
            global_cap: 1000,
        }
    }

    /// Override the global credit cap (builder pattern).
    pub fn with_global_cap(mut self, cap: u64) -> Self {
        self.global_cap = cap;
        self
    }

    fn load_summary(&self) -> Option<SessionSummary> {
        SessionSummarizer::new(&self.summary_path).load_summary()
    }

    fn load_metrics(&self) -> Vec<MetricsRow> {
        match read_metrics_csv(&self.metrics_path) {
            Ok(rows) => rows,
            Err(err) => {
                log::warn!(
                    "failed to load metrics {}: {}",
                    self.metrics_path.display(),
                    err
                );
                Vec::new()
            }
        }
    }

    /// Aggregate everything the report needs.
    pub fn analyze(&self) -> Analysis {
        let summary = self.load_summary();
        let rows = self.load_metrics();
        let mut analysis = Analysis::default();

        if let Some(summary) = &summary {
            analysis.total_credits = summary.credits.used;
            for (agent, credits) in &summary.credits.max_per_agent {
                analysis.credits_by_agent.insert(agent.clone(), *credits);
            }
            analysis.aborted_agents = summary.agents.aborted.clone();
            for warning in &summary.warnings {
                if warning.level == WarningLevel::Error {
                    analysis.critical = true;
                }
                if warning.level != WarningLevel::Info {
                    analysis.warnings.push(warning.msg.clone());
                }
            }
        } else {
            analysis
                .warnings
                .push(format!("no session summary at {}", self.summary_path.display()));
        }

        for row in &rows {
            *analysis
                .credits_by_agent
                .entry(row.agent.clone())
                .or_insert(0) += row.credits;
            *analysis
                .credits_by_tool
                .entry(row.tool_call.clone())
                .or_insert(0) += row.credits;
            *analysis
                .verdict_counts
                .entry(row.exit_status.clone())
                .or_insert(0) += 1;
        }

        if analysis.total_credits == 0 {
            analysis.total_credits = rows.iter().map(|row| row.credits).sum();
        }
        analysis.utilization_pct = if self.global_cap > 0 {
            analysis.total_credits as f64 / self.global_cap as f64 * 100.0
        } else {
            0.0
        };
        if analysis.utilization_pct >= 95.0 {
            analysis.critical = true;
            analysis.warnings.push(format!(
                "CRITICAL: credit usage at {:.1}%",
                analysis.utilization_pct
            ));
        } else if analysis.utilization_pct >= 80.0 {
            analysis.warnings.push(format!(
                "WARNING: credit usage at {:.1}%",
                analysis.utilization_pct
            ));
        }
        if !analysis.aborted_agents.is_empty() {
            analysis.critical = true;
        }

        let mut consumers: Vec<(String, u64)> = analysis
            .credits_by_agent
            .iter()
            .map(|(agent, credits)| (agent.clone(), *credits))
            .collect();
        consumers.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        consumers.truncate(5);
        analysis.high_consumers = consumers;

        let successful = rows
            .iter()
            .filter(|row| matches!(row.exit_status.as_str(), "allow" | "checkpoint"))
            .count();
        analysis.efficiency_score = if rows.is_empty() {
            1.0
        } else {
            successful as f64 / rows.len() as f64
        };

        analysis
    }

    /// Render the analysis as a plain-text report.
    pub fn render_report(&self, analysis: &Analysis) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== evoloop meta-analyst report ===");
        let _ = writeln!(
            report,
            "credits used: {}/{} ({:.1}%)",
            analysis.total_credits, self.global_cap, analysis.utilization_pct
        );
        let _ = writeln!(report, "efficiency score: {:.2}", analysis.efficiency_score);

        if !analysis.high_consumers.is_empty() {
            let _ = writeln!(report, "\ntop consumers:");
            for (agent, credits) in &analysis.high_consumers {
                let _ = writeln!(report, "  {:<24} {:>6} credits", agent, credits);
            }
        }
        if !analysis.credits_by_tool.is_empty() {
            let _ = writeln!(report, "\ncredits by tool:");
            for (tool, credits) in &analysis.credits_by_tool {
                let _ = writeln!(report, "  {:<24} {:>6} credits", tool, credits);
            }
        }
        if !analysis.verdict_counts.is_empty() {
            let _ = writeln!(report, "\nverdicts:");
            for (verdict, count) in &analysis.verdict_counts {
                let _ = writeln!(report, "  {:<12} {:>6}", verdict, count);
            }
        }
        if !analysis.aborted_agents.is_empty() {
            let _ = writeln!(
                report,
                "\naborted agents: {}",
                analysis.aborted_agents.join(", ")
            );
        }
        if !analysis.warnings.is_empty() {
            let _ = writeln!(report, "\nwarnings:");
            for warning in &analysis.warnings {
                let _ = writeln!(report, "  - {}", warning);
            }
        }
        let _ = writeln!(
            report,
            "\nstatus: {}",
            if analysis.critical { "CRITICAL" } else { "ok" }
        );
        report
    }

    /// Analyze, print the report, and return the process exit code:
    /// 0 on success, 1 when any critical threshold tripped.
    pub fn run(&self) -> i32 {
        let analysis = self.analyze();
        println!("{}", self.render_report(&analysis));
        if analysis.critical {
            1
        } else {
            0
        }
    }
}
