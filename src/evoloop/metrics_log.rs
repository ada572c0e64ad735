//! Append-only CSV log of admission decisions.
//!
//! One row per sentinel verdict, written outside the sentinel's state lock.
//! Write failures are logged and swallowed — the metrics log must never
//! block admission.
//!
//! Header: `team_id,timestamp,agent,tokens,credits,wall_time_ms,model,tool_call,exit_status`

use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Column headers, in write order.
pub const CSV_HEADER: &str =
    "team_id,timestamp,agent,tokens,credits,wall_time_ms,model,tool_call,exit_status";

/// Default model label recorded in the `model` column.
pub const DEFAULT_MODEL: &str = "claude-3";

/// Serialized writer for the admission CSV.
///
/// Concurrent appenders serialize through an internal mutex; each append
/// opens the file, writes one row, and flushes, so rows from different
/// tasks never interleave.
pub struct MetricsLog {
    path: PathBuf,
    model: String,
    write_lock: Mutex<()>,
}

impl MetricsLog {
    /// Create a log writing to `path` with the default model label.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            model: DEFAULT_MODEL.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Override the model label (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Path this log writes to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one admission row. Never returns an error; failures are
    /// logged at `error` level and otherwise ignored.
    pub fn append(
        &self,
        agent: &str,
        tool: &str,
        credits: u64,
        tokens: u64,
        wall_time_ms: u64,
        exit_status: &str,
    ) {
        let _guard = match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Err(e) = self.try_append(agent, tool, credits, tokens, wall_time_ms, exit_status) {
            log::error!("metrics log append failed for {}: {}", self.path.display(), e);
        }
    }

    fn try_append(
        &self,
        agent: &str,
        tool: &str,
        credits: u64,
        tokens: u64,
        wall_time_ms: u64,
        exit_status: &str,
    ) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let write_header = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if write_header {
            writeln!(file, "{}", CSV_HEADER)?;
        }
        writeln!(
            file,
            "default,{},{},{},{},{},{},{},{}",
            Utc::now().to_rfc3339(),
            agent,
            tokens,
            credits,
            wall_time_ms,
            self.model,
            tool,
            exit_status
        )?;
        file.flush()
    }
}

/// One parsed row of the admission CSV, used by the meta-analyst.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    pub team_id: String,
    pub timestamp: String,
    pub agent: String,
    pub tokens: u64,
    pub credits: u64,
    pub wall_time_ms: u64,
    pub model: String,
    pub tool_call: String,
    pub exit_status: String,
}

/// Parse the admission CSV produced by [`MetricsLog`]. Rows that do not
/// parse are skipped with a warning rather than failing the whole read.
pub fn read_metrics_csv(path: impl AsRef<Path>) -> std::io::Result<Vec<MetricsRow>> {
    let text = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if index == 0 || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() != 9 {
            log::warn!("skipping malformed metrics row {}: {:?}", index + 1, line);
            continue;
        }
        let numeric = |s: &str| s.trim().parse::<u64>().unwrap_or(0);
        rows.push(MetricsRow {
            team_id: fields[0].to_string(),
            timestamp: fields[1].to_string(),
            agent: fields[2].to_string(),
            tokens: numeric(fields[3]),
            credits: numeric(fields[4]),
            wall_time_ms: numeric(fields[5]),
            model: fields[6].to_string(),
            tool_call: fields[7].to_string(),
            exit_status: fields[8].to_string(),
        });
    }
    Ok(rows)
}
