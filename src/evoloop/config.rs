//! Sentinel and orchestrator configuration.
//!
//! A single typed [`SentinelConfig`] struct loaded from a YAML file at
//! startup, with per-agent credit limits overridable through
//! `CREDIT_LIMIT_<NAME>` environment variables. A missing config file is
//! tolerated (defaults apply) but logged as a warning; a malformed file is a
//! fatal [`ConfigError`].
//!
//! # Example
//!
//! ```rust
//! use evoloop::config::SentinelConfig;
//!
//! let config = SentinelConfig::default();
//! assert_eq!(config.global_hard_cap, 1000);
//! assert_eq!(config.agent_cap("anyone"), 200);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::Path;

/// How a detected lock-wait cycle is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResolutionPolicy {
    /// Abort the cycle member whose most recently acquired lock is newest,
    /// releasing all of its locks.
    YoungestHolder,
    /// Deny the request that would complete the cycle; abort nobody.
    DenyRequester,
}

impl Default for LockResolutionPolicy {
    fn default() -> Self {
        LockResolutionPolicy::YoungestHolder
    }
}

/// Tunable limits for the credit sentinel and its collaborators.
///
/// Every field has a serde default so a partial YAML file only overrides
/// what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Total credits allowed for the whole session across all agents.
    pub global_hard_cap: u64,

    /// Credits between automatic checkpoints.
    pub checkpoint_interval: u64,

    /// Credit cap applied to agents with no entry in `agent_caps`.
    pub default_agent_cap: u64,

    /// Wall-time limit applied to agents with no entry in
    /// `wall_time_limits`, in milliseconds.
    pub default_wall_time_limit_ms: u64,

    /// Per-agent credit caps.
    pub agent_caps: BTreeMap<String, u64>,

    /// Per-agent wall-time limits in milliseconds.
    pub wall_time_limits: BTreeMap<String, u64>,

    /// Deadlock resolution policy.
    pub lock_resolution_policy: LockResolutionPolicy,

    /// Maximum age of a session summary before validation rejects it.
    pub max_context_staleness_seconds: u64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            global_hard_cap: 1000,
            checkpoint_interval: 50,
            default_agent_cap: 200,
            default_wall_time_limit_ms: 45_000,
            agent_caps: BTreeMap::new(),
            wall_time_limits: BTreeMap::new(),
            lock_resolution_policy: LockResolutionPolicy::default(),
            max_context_staleness_seconds: 3600,
        }
    }
}

impl SentinelConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file yields the defaults with a warning; a file that
    /// exists but fails to parse is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::warn!(
                "sentinel config {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        serde_yaml::from_str(&text)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e.to_string()))
    }

    /// Effective credit cap for an agent: its `agent_caps` entry, an
    /// environment override, or the default cap.
    pub fn agent_cap(&self, agent: &str) -> u64 {
        if let Some(cap) = credit_limit_from_env(agent) {
            return cap;
        }
        self.agent_caps
            .get(agent)
            .copied()
            .unwrap_or(self.default_agent_cap)
    }

    /// Effective wall-time limit for an agent in milliseconds.
    pub fn wall_time_limit_ms(&self, agent: &str) -> u64 {
        self.wall_time_limits
            .get(agent)
            .copied()
            .unwrap_or(self.default_wall_time_limit_ms)
    }
}

/// Read the `CREDIT_LIMIT_<NAME>` override for an agent, if set.
///
/// The agent name is uppercased and hyphens become underscores, so
/// `external-auditor` reads `CREDIT_LIMIT_EXTERNAL_AUDITOR`. Unparsable
/// values are ignored with a warning.
pub fn credit_limit_from_env(agent: &str) -> Option<u64> {
    let key = format!(
        "CREDIT_LIMIT_{}",
        agent.to_ascii_uppercase().replace('-', "_")
    );
    let raw = std::env::var(&key).ok()?;
    match raw.parse::<u64>() {
        Ok(limit) => Some(limit),
        Err(_) => {
            log::warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

/// Fatal configuration problems encountered at startup.
#[derive(Debug)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    Io(String, String),
    /// The config file exists but is not valid YAML for [`SentinelConfig`].
    Parse(String, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "failed to read config {}: {}", path, err),
            ConfigError::Parse(path, err) => {
                write!(f, "failed to parse config {}: {}", path, err)
            }
        }
    }
}

impl Error for ConfigError {}
