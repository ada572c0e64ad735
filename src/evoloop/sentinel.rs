//! Credit Sentinel — real-time admission control for agents.
//!
//! The sentinel is the single source of truth for "may this agent do this
//! next thing?". It tracks per-agent and global resource consumption
//! (credits, tokens, wall-time), answers every tool call with a
//! [`Verdict`], manages cooperative file locks with deadlock detection, and
//! appends one row to the admission CSV per decision.
//!
//! # Verdict ladder
//!
//! Limits are evaluated in a fixed order; the first match wins:
//!
//! ```text
//! total ≥ global_hard_cap          → Abort
//! agent ≥ cap                      → Abort   (agent becomes terminal)
//! agent ≥ 0.9·cap                  → Throttle
//! agent ≥ 0.8·cap                  → Warn
//! agent > 0, agent % interval == 0 → Checkpoint
//! otherwise                        → Allow
//! ```
//!
//! # Concurrency
//!
//! All state lives behind one short-critical-section mutex: counter updates
//! and map lookups only. The CSV append happens after the lock is released,
//! through the [`MetricsLog`]'s own writer mutex. Verdicts for a single
//! agent are linearizable; across agents only the global totals are atomic.
//!
//! # Example
//!
//! ```rust
//! use evoloop::config::SentinelConfig;
//! use evoloop::sentinel::{CreditSentinel, Verdict};
//!
//! let sentinel = CreditSentinel::new(SentinelConfig::default());
//! assert_eq!(sentinel.track_agent_start("planner"), Verdict::Allow);
//! assert_eq!(
//!     sentinel.track_tool_call("planner", "grep", 5, 500),
//!     Verdict::Allow
//! );
//! ```

use crate::evoloop::config::{LockResolutionPolicy, SentinelConfig};
use crate::evoloop::metrics_log::MetricsLog;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Admission decision returned by every sentinel call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Proceed.
    Allow,
    /// Proceed, but the agent is at ≥ 80 % of its cap.
    Warn,
    /// Proceed; a checkpoint row was recorded for the agent.
    Checkpoint,
    /// The agent is at ≥ 90 % of its cap; callers should back off.
    Throttle,
    /// The agent (or the session) is out of budget; callers must stop.
    Abort,
}

impl Verdict {
    /// Stable string used in the metrics CSV `exit_status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Warn => "warn",
            Verdict::Checkpoint => "checkpoint",
            Verdict::Throttle => "throttle",
            Verdict::Abort => "abort",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent lifecycle status. `Aborted` is terminal within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Aborted,
}

/// A durable snapshot row recorded when an agent crosses a checkpoint
/// boundary.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointRecord {
    pub time: DateTime<Utc>,
    pub credits: u64,
    pub tokens: u64,
    pub wall_time_ms: u64,
    pub tool_calls: u64,
}

/// Per-agent counters. Mutated only through the sentinel's admission path.
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub name: String,
    pub credits_used: u64,
    pub tokens_used: u64,
    pub wall_time_ms: u64,
    pub tool_calls: u64,
    pub checkpoints: Vec<CheckpointRecord>,
    pub start_time: DateTime<Utc>,
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

impl AgentMetrics {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            credits_used: 0,
            tokens_used: 0,
            wall_time_ms: 0,
            tool_calls: 0,
            checkpoints: Vec::new(),
            start_time: Utc::now(),
            last_checkpoint: None,
            status: AgentStatus::Active,
        }
    }
}

/// System-wide counters. `total_credits` always equals the sum of
/// `credits_used` over every agent ever observed in the session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalMetrics {
    pub total_credits: u64,
    pub total_tokens: u64,
    pub total_wall_time_ms: u64,
    pub active_agents: u64,
    pub throttled_agents: u64,
    pub aborted_agents: u64,
    pub total_tool_calls: u64,
}

/// A held file lock: who holds it and since when.
#[derive(Debug, Clone, Serialize)]
pub struct LockEntry {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// The cap/interval subset of the configuration echoed in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotConfig {
    pub global_hard_cap: u64,
    pub checkpoint_interval: u64,
}

/// Full serializable view of sentinel state.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub global: GlobalMetrics,
    pub agents: BTreeMap<String, AgentMetrics>,
    pub locks: BTreeMap<String, LockEntry>,
    pub config: SnapshotConfig,
}

struct SentinelState {
    agents: HashMap<String, AgentMetrics>,
    global: GlobalMetrics,
    locks: HashMap<String, LockEntry>,
    /// Which path each blocked agent is currently waiting on. One pending
    /// want per agent; cleared on acquisition, denial, or abort.
    waiting: HashMap<String, String>,
    throttled: HashSet<String>,
}

impl SentinelState {
    fn new() -> Self {
        Self {
            agents: HashMap::new(),
            global: GlobalMetrics::default(),
            locks: HashMap::new(),
            waiting: HashMap::new(),
            throttled: HashSet::new(),
        }
    }
}

/// Real-time monitoring and throttling of agent credit/token/wall-time
/// usage, plus cooperative file locking.
///
/// One instance is created at orchestrator startup and shared (via `Arc`)
/// with every runtime — there is no process singleton.
pub struct CreditSentinel {
    config: SentinelConfig,
    state: Mutex<SentinelState>,
    metrics_log: Option<MetricsLog>,
    monitor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    monitor_shutdown: Arc<Notify>,
}

impl CreditSentinel {
    /// Create a sentinel with the given limits and no metrics log.
    pub fn new(config: SentinelConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SentinelState::new()),
            metrics_log: None,
            monitor: tokio::sync::Mutex::new(None),
            monitor_shutdown: Arc::new(Notify::new()),
        }
    }

    /// Attach an admission CSV log (builder pattern).
    pub fn with_metrics_log(mut self, log: MetricsLog) -> Self {
        self.metrics_log = Some(log);
        self
    }

    /// Effective configuration.
    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SentinelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an agent (idempotent) and decide whether it may start.
    ///
    /// Returns [`Verdict::Abort`] when the session budget is already spent
    /// or the agent was previously aborted; [`Verdict::Allow`] otherwise.
    pub fn track_agent_start(&self, agent: &str) -> Verdict {
        let mut state = self.lock_state();
        if !state.agents.contains_key(agent) {
            state.agents.insert(agent.to_string(), AgentMetrics::new(agent));
            state.global.active_agents += 1;
        }
        if state.agents[agent].status == AgentStatus::Aborted {
            return Verdict::Abort;
        }
        if state.global.total_credits >= self.config.global_hard_cap {
            return Verdict::Abort;
        }
        Verdict::Allow
    }

    /// Record a tool call and decide the throttle action.
    ///
    /// Appends to the agent's and the global counters, evaluates the limit
    /// ladder, performs the verdict's side effect (checkpoint row or
    /// abort), and logs one CSV row. Calls against an already-aborted agent
    /// are no-ops that return [`Verdict::Abort`].
    pub fn track_tool_call(&self, agent: &str, tool: &str, credits: u64, tokens: u64) -> Verdict {
        let (verdict, wall_time_ms) = {
            let mut state = self.lock_state();
            if !state.agents.contains_key(agent) {
                state.agents.insert(agent.to_string(), AgentMetrics::new(agent));
                state.global.active_agents += 1;
            }

            if state.agents[agent].status == AgentStatus::Aborted {
                let wall = state.agents[agent].wall_time_ms;
                (Verdict::Abort, wall)
            } else {
                let now = Utc::now();
                {
                    let metrics = state.agents.get_mut(agent).expect("registered above");
                    metrics.credits_used += credits;
                    metrics.tokens_used += tokens;
                    metrics.tool_calls += 1;
                    if metrics.status == AgentStatus::Active {
                        metrics.wall_time_ms =
                            (now - metrics.start_time).num_milliseconds().max(0) as u64;
                    }
                }
                state.global.total_credits += credits;
                state.global.total_tokens += tokens;
                state.global.total_tool_calls += 1;
                state.global.total_wall_time_ms =
                    state.agents.values().map(|m| m.wall_time_ms).sum();

                let verdict = self.check_limits(&state, agent);
                match verdict {
                    Verdict::Checkpoint => {
                        let metrics = state.agents.get_mut(agent).expect("registered above");
                        metrics.checkpoints.push(CheckpointRecord {
                            time: now,
                            credits: metrics.credits_used,
                            tokens: metrics.tokens_used,
                            wall_time_ms: metrics.wall_time_ms,
                            tool_calls: metrics.tool_calls,
                        });
                        metrics.last_checkpoint = Some(now);
                    }
                    Verdict::Throttle => {
                        if state.throttled.insert(agent.to_string()) {
                            state.global.throttled_agents = state.throttled.len() as u64;
                        }
                    }
                    Verdict::Abort => {
                        Self::abort_locked(&mut state, agent, "credit limit exceeded");
                    }
                    _ => {}
                }
                let wall = state.agents[agent].wall_time_ms;
                (verdict, wall)
            }
        };

        if let Some(log) = &self.metrics_log {
            log.append(agent, tool, credits, tokens, wall_time_ms, verdict.as_str());
        }
        verdict
    }

    fn check_limits(&self, state: &SentinelState, agent: &str) -> Verdict {
        if state.global.total_credits >= self.config.global_hard_cap {
            return Verdict::Abort;
        }

        let metrics = &state.agents[agent];
        let cap = self.config.agent_cap(agent);
        let used = metrics.credits_used as f64;

        if metrics.credits_used >= cap {
            return Verdict::Abort;
        }
        if used >= cap as f64 * 0.9 {
            return Verdict::Throttle;
        }
        if used >= cap as f64 * 0.8 {
            return Verdict::Warn;
        }

        let interval = self.config.checkpoint_interval;
        if interval > 0 && metrics.credits_used > 0 && metrics.credits_used % interval == 0 {
            return Verdict::Checkpoint;
        }

        Verdict::Allow
    }

    /// Transition an agent to `Aborted`, releasing all of its locks.
    /// Idempotent: re-aborting a terminal agent is a no-op.
    pub fn abort_agent(&self, agent: &str, reason: &str) {
        let mut state = self.lock_state();
        Self::abort_locked(&mut state, agent, reason);
    }

    fn abort_locked(state: &mut SentinelState, agent: &str, reason: &str) {
        let previous = match state.agents.get(agent).map(|m| m.status) {
            Some(status) => status,
            None => return,
        };
        if previous == AgentStatus::Aborted {
            return;
        }
        if previous == AgentStatus::Active {
            state.global.active_agents = state.global.active_agents.saturating_sub(1);
        }
        if let Some(metrics) = state.agents.get_mut(agent) {
            metrics.status = AgentStatus::Aborted;
        }
        state.global.aborted_agents += 1;
        state.waiting.remove(agent);
        state.locks.retain(|_, entry| entry.holder != agent);
        log::warn!("ABORT: agent {} - {}", agent, reason);
    }

    /// Transition an active agent to `Idle`. No-op for any other status.
    pub fn mark_idle(&self, agent: &str) {
        let mut state = self.lock_state();
        let was_active = matches!(
            state.agents.get(agent).map(|m| m.status),
            Some(AgentStatus::Active)
        );
        if was_active {
            if let Some(metrics) = state.agents.get_mut(agent) {
                metrics.status = AgentStatus::Idle;
            }
            state.global.active_agents = state.global.active_agents.saturating_sub(1);
        }
    }

    /// Current status of an agent, if it has been seen this session.
    pub fn agent_status(&self, agent: &str) -> Option<AgentStatus> {
        self.lock_state().agents.get(agent).map(|m| m.status)
    }

    /// Credits consumed so far by an agent (0 if unseen).
    pub fn credits_used(&self, agent: &str) -> u64 {
        self.lock_state()
            .agents
            .get(agent)
            .map(|m| m.credits_used)
            .unwrap_or(0)
    }

    // ── File locks ──────────────────────────────────────────────────────

    /// Acquire the cooperative lock on `path` for `agent`.
    ///
    /// Returns `true` when the agent already holds the lock or newly
    /// acquires it. When another agent holds it, the requester is recorded
    /// as waiting and the wait-for graph is checked; a cycle triggers the
    /// configured [`LockResolutionPolicy`] and the call returns `false`.
    pub fn acquire_lock(&self, agent: &str, path: &str) -> bool {
        let mut state = self.lock_state();

        if let Some(status) = state.agents.get(agent).map(|m| m.status) {
            if status == AgentStatus::Aborted {
                return false;
            }
        }

        let holder = state.locks.get(path).map(|entry| entry.holder.clone());
        match holder {
            Some(holder) if holder == agent => true,
            Some(_) => {
                state.waiting.insert(agent.to_string(), path.to_string());
                if let Some(cycle) = Self::find_cycle(&state, agent, path) {
                    log::warn!(
                        "deadlock detected on {}: cycle {:?}",
                        path,
                        cycle
                    );
                    match self.config.lock_resolution_policy {
                        LockResolutionPolicy::YoungestHolder => {
                            if let Some(victim) = Self::youngest_holder(&state, &cycle) {
                                Self::abort_locked(
                                    &mut state,
                                    &victim,
                                    "deadlock resolution: youngest holder",
                                );
                            }
                        }
                        LockResolutionPolicy::DenyRequester => {
                            state.waiting.remove(agent);
                        }
                    }
                }
                false
            }
            None => {
                state.locks.insert(
                    path.to_string(),
                    LockEntry {
                        holder: agent.to_string(),
                        acquired_at: Utc::now(),
                    },
                );
                state.waiting.remove(agent);
                true
            }
        }
    }

    /// Release the lock on `path` if `agent` is its holder; no-op otherwise.
    pub fn release_lock(&self, agent: &str, path: &str) {
        let mut state = self.lock_state();
        if state
            .locks
            .get(path)
            .map(|entry| entry.holder == agent)
            .unwrap_or(false)
        {
            state.locks.remove(path);
        }
    }

    /// Walk the wait-for chain starting at the holder of `path`. Each agent
    /// has at most one pending want, so the chain is linear; if it returns
    /// to the requester a cycle exists. Returns the cycle's members.
    fn find_cycle(state: &SentinelState, requester: &str, path: &str) -> Option<Vec<String>> {
        let mut chain = vec![requester.to_string()];
        let mut current = state.locks.get(path)?.holder.clone();
        loop {
            if current == requester {
                return Some(chain);
            }
            if chain.contains(&current) {
                return None;
            }
            chain.push(current.clone());
            let wanted = state.waiting.get(&current)?;
            current = state.locks.get(wanted)?.holder.clone();
        }
    }

    /// The cycle member whose most recently acquired lock is newest.
    fn youngest_holder(state: &SentinelState, cycle: &[String]) -> Option<String> {
        cycle
            .iter()
            .filter_map(|agent| {
                state
                    .locks
                    .values()
                    .filter(|entry| &entry.holder == agent)
                    .map(|entry| entry.acquired_at)
                    .max()
                    .map(|newest| (agent.clone(), newest))
            })
            .max_by_key(|(_, newest)| *newest)
            .map(|(agent, _)| agent)
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Serializable snapshot of global counters, per-agent metrics, held
    /// locks, and the effective cap configuration.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let state = self.lock_state();
        MetricsSnapshot {
            global: state.global.clone(),
            agents: state
                .agents
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            locks: state
                .locks
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            config: SnapshotConfig {
                global_hard_cap: self.config.global_hard_cap,
                checkpoint_interval: self.config.checkpoint_interval,
            },
        }
    }

    /// Export the metrics snapshot as pretty JSON, optionally writing it to
    /// a file as well.
    pub fn export_metrics_json(
        &self,
        output_path: Option<&std::path::Path>,
    ) -> std::io::Result<String> {
        let snapshot = self.get_metrics();
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(path) = output_path {
            std::fs::write(path, &json)?;
        }
        Ok(json)
    }

    // ── Wall-time monitor ───────────────────────────────────────────────

    /// Start the background wall-time monitor.
    ///
    /// Once per second the monitor recomputes `wall_time_ms` for every
    /// active agent and aborts any agent at or past its wall-time limit.
    /// Idempotent: a second call while running is a no-op.
    pub async fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().await;
        if monitor.is_some() {
            return;
        }
        let sentinel = Arc::clone(self);
        let shutdown = Arc::clone(&self.monitor_shutdown);
        *monitor = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sentinel.monitor_tick(),
                    _ = shutdown.notified() => break,
                }
            }
        }));
    }

    fn monitor_tick(&self) {
        let mut state = self.lock_state();
        let now = Utc::now();
        let mut expired = Vec::new();
        for (name, metrics) in state.agents.iter_mut() {
            if metrics.status != AgentStatus::Active {
                continue;
            }
            metrics.wall_time_ms = (now - metrics.start_time).num_milliseconds().max(0) as u64;
            if metrics.wall_time_ms >= self.config.wall_time_limit_ms(name) {
                expired.push(name.clone());
            }
        }
        state.global.total_wall_time_ms = state.agents.values().map(|m| m.wall_time_ms).sum();
        for name in expired {
            Self::abort_locked(&mut state, &name, "wall-time limit exceeded");
        }
    }

    /// Stop the wall-time monitor and wait for its task to exit.
    pub async fn stop_monitoring(&self) {
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            self.monitor_shutdown.notify_one();
            let _ = handle.await;
        }
    }
}
