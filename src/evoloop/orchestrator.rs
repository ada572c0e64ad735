//! Evolution Orchestrator — drives phased evolution cycles over the bus.
//!
//! The orchestrator provisions the agent runtimes, correlates request and
//! reply messages across the bus, and records every cycle in a
//! [`CycleRecord`]. One cycle walks six phases:
//!
//! ```text
//! 0. financial   treasurer-in   balance / burn / runway; may hard-halt
//! 1. audit       auditor-in     list of proposals
//! 2. review      reviewer-in    review per proposal
//! 3. decisions   architect-in   approve / reject per proposal
//! 4. implement   implementor-in success / failure per approved proposal
//! 5. treasury    local file     deduct daily burn; persist wallet
//! ```
//!
//! Each phase sends a request to the agent's input topic and waits for the
//! correlated reply with a bounded timeout; a missing reply records `null`
//! for that phase and the cycle continues. Only the financial phase may
//! halt a cycle, by replying with `"hard_halt": true`. A shared consumer on
//! every agent's output topic enriches the active cycle record with the raw
//! message traffic.
//!
//! # Example
//!
//! ```rust,no_run
//! use evoloop::config::SentinelConfig;
//! use evoloop::orchestrator::{EvolutionOrchestrator, OrchestratorConfig};
//! use evoloop::runtime::EchoAgent;
//! use std::sync::Arc;
//!
//! # async {
//! let orchestrator =
//!     EvolutionOrchestrator::new(SentinelConfig::default(), OrchestratorConfig::default());
//! orchestrator.register_agent("treasurer", Arc::new(EchoAgent));
//! orchestrator.initialize().await.unwrap();
//! let record = orchestrator.run_evolution_cycle().await;
//! println!("proposals: {}", record.proposals_generated);
//! orchestrator.shutdown().await;
//! # };
//! ```

use crate::evoloop::bus::{BusMessage, MessageBus, MessageHandler};
use crate::evoloop::config::SentinelConfig;
use crate::evoloop::runtime::{EvolutionAgent, RuntimeConfig, RuntimeError};
use crate::evoloop::sentinel::CreditSentinel;
use crate::evoloop::spawner::AgentSpawner;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared topics created at initialization.
pub const SHARED_TOPICS: [&str; 4] = [
    "evolution-events",
    "evolution-proposals",
    "evolution-decisions",
    "evolution-implementations",
];

/// The canonical agent set the cycle protocol addresses.
pub const CANONICAL_AGENTS: [&str; 5] =
    ["auditor", "reviewer", "architect", "implementor", "treasurer"];

/// Treasury state persisted between cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub balances: BTreeMap<String, f64>,
    pub burn_rate_daily: f64,
}

impl Default for Wallet {
    fn default() -> Self {
        let mut balances = BTreeMap::new();
        balances.insert("USD".to_string(), 0.0);
        Self {
            balances,
            burn_rate_daily: 10.0,
        }
    }
}

impl Wallet {
    /// Load the wallet from a JSON file, falling back to an empty default
    /// when the file is missing or unreadable.
    pub fn load(path: &std::path::Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(wallet) => wallet,
                Err(err) => {
                    log::error!("failed to parse wallet {}: {}", path.display(), err);
                    Self::default()
                }
            },
            Err(err) => {
                log::warn!("failed to load wallet {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    /// Persist the wallet as pretty JSON.
    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// USD balance, the currency the burn rate applies to.
    pub fn usd_balance(&self) -> f64 {
        self.balances.get("USD").copied().unwrap_or(0.0)
    }

    /// Days of runway at the current burn rate (999 when burn is zero).
    pub fn runway_days(&self) -> i64 {
        if self.burn_rate_daily > 0.0 {
            (self.usd_balance() / self.burn_rate_daily) as i64
        } else {
            999
        }
    }
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Where the treasury wallet JSON lives.
    pub wallet_path: PathBuf,
    /// Timeout for each phase's request/reply wait.
    pub phase_timeout: Duration,
    /// Runway threshold below which a `summon_alert` is emitted.
    pub runway_alert_days: i64,
    /// Base runtime config for spawned agents; per-agent credit limits come
    /// from the sentinel configuration (and its env overrides).
    pub runtime: RuntimeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            wallet_path: PathBuf::from("treasury/wallet.json"),
            phase_timeout: Duration::from_secs(10),
            runway_alert_days: 60,
            runtime: RuntimeConfig::default(),
        }
    }
}

/// Log entry for one completed (or halted) cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub start_time: DateTime<Utc>,
    /// Phase name → phase outcome. A phase whose reply never arrived is
    /// recorded as `null`.
    pub phases: BTreeMap<String, Value>,
    pub proposals_generated: u64,
    pub proposals_approved: u64,
    pub implementations_successful: u64,
    pub errors: Vec<String>,
    /// Raw agent output traffic observed during the cycle.
    pub messages: Vec<BusMessage>,
}

impl CycleRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            cycle_id: format!("cycle_{}", now.format("%Y%m%d_%H%M%S")),
            start_time: now,
            phases: BTreeMap::new(),
            proposals_generated: 0,
            proposals_approved: 0,
            implementations_successful: 0,
            errors: Vec::new(),
            messages: Vec::new(),
        }
    }
}

/// Startup failures for the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// The bus reported itself unhealthy at initialization.
    BusUnavailable,
    /// An agent runtime failed to start.
    Runtime(String, RuntimeError),
    /// Registering the shared output consumer failed.
    Consumer(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::BusUnavailable => write!(f, "message bus is unavailable"),
            OrchestratorError::Runtime(agent, err) => {
                write!(f, "failed to spawn agent {}: {}", agent, err)
            }
            OrchestratorError::Consumer(err) => {
                write!(f, "failed to set up output consumer: {}", err)
            }
        }
    }
}

impl Error for OrchestratorError {}

/// Shared output consumer that appends observed agent traffic to the
/// active cycle record.
struct OutputCollector {
    active_cycle: Arc<Mutex<Option<CycleRecord>>>,
}

#[async_trait]
impl MessageHandler for OutputCollector {
    async fn handle(&self, message: BusMessage) {
        log::debug!(
            "observed {} from {}",
            message.kind,
            message.agent.as_deref().unwrap_or("?")
        );
        let mut active = match self.active_cycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cycle) = active.as_mut() {
            cycle.messages.push(message);
        }
    }
}

/// Top-level driver: provisions runtimes, runs phased cycles, and keeps the
/// cycle history.
pub struct EvolutionOrchestrator {
    config: OrchestratorConfig,
    bus: Arc<MessageBus>,
    sentinel: Arc<CreditSentinel>,
    spawner: AgentSpawner,
    registered: Mutex<Vec<(String, Arc<dyn EvolutionAgent>)>>,
    wallet: Mutex<Wallet>,
    active_cycle: Arc<Mutex<Option<CycleRecord>>>,
    cycle_history: Mutex<Vec<CycleRecord>>,
    running: AtomicBool,
    shutdown: Notify,
}

impl EvolutionOrchestrator {
    /// Create an orchestrator owning a fresh bus and sentinel.
    pub fn new(sentinel_config: SentinelConfig, config: OrchestratorConfig) -> Self {
        let bus = Arc::new(MessageBus::new());
        let sentinel = Arc::new(CreditSentinel::new(sentinel_config));
        Self::with_parts(bus, sentinel, config)
    }

    /// Create an orchestrator around externally constructed parts (used
    /// when the sentinel carries a metrics log or the bus is shared).
    pub fn with_parts(
        bus: Arc<MessageBus>,
        sentinel: Arc<CreditSentinel>,
        config: OrchestratorConfig,
    ) -> Self {
        let wallet = Wallet::load(&config.wallet_path);
        Self {
            spawner: AgentSpawner::new(Arc::clone(&bus), Arc::clone(&sentinel)),
            bus,
            sentinel,
            config,
            registered: Mutex::new(Vec::new()),
            wallet: Mutex::new(wallet),
            active_cycle: Arc::new(Mutex::new(None)),
            cycle_history: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    /// Register an agent implementation for `initialize` to spawn. The
    /// cycle protocol addresses the [`CANONICAL_AGENTS`] ids; other ids are
    /// spawned and supervised but not driven by the phases.
    pub fn register_agent(&self, agent_id: impl Into<String>, agent: Arc<dyn EvolutionAgent>) {
        let mut registered = match self.registered.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registered.push((agent_id.into(), agent));
    }

    /// Shared bus handle (for attaching external subscribers such as an
    /// embedder pipeline to `evolution-events`).
    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    /// Shared sentinel handle.
    pub fn sentinel(&self) -> Arc<CreditSentinel> {
        Arc::clone(&self.sentinel)
    }

    /// Aggregated runtime health, keyed by agent id.
    pub async fn get_all_health(
        &self,
    ) -> std::collections::HashMap<String, crate::evoloop::runtime::RuntimeHealth> {
        self.spawner.get_all_health().await
    }

    /// Completed cycle records, oldest first.
    pub fn cycle_history(&self) -> Vec<CycleRecord> {
        match self.cycle_history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Initialize the engine: assert bus health, provision topics, spawn
    /// every registered agent, wire the shared output consumer, and publish
    /// `engine_initialized`.
    pub async fn initialize(&self) -> Result<(), OrchestratorError> {
        log::info!("evolution engine initializing");

        if !self.bus.health_check().is_healthy() {
            return Err(OrchestratorError::BusUnavailable);
        }
        self.sentinel.start_monitoring().await;

        let registered: Vec<(String, Arc<dyn EvolutionAgent>)> = {
            let guard = match self.registered.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };

        for topic in SHARED_TOPICS {
            self.bus.ensure_topic(topic);
        }
        for (agent_id, _) in &registered {
            self.bus.ensure_topic(&format!("{}-in", agent_id));
            self.bus.ensure_topic(&format!("{}-out", agent_id));
        }

        for (agent_id, agent) in &registered {
            let mut runtime_config = self.config.runtime.clone();
            runtime_config.credit_limit = self.sentinel.config().agent_cap(agent_id);
            self.spawner
                .spawn_agent(agent_id.clone(), Arc::clone(agent), runtime_config)
                .await
                .map_err(|err| OrchestratorError::Runtime(agent_id.clone(), err))?;
        }

        let output_topics: Vec<String> = registered
            .iter()
            .map(|(agent_id, _)| format!("{}-out", agent_id))
            .collect();
        let collector = Arc::new(OutputCollector {
            active_cycle: Arc::clone(&self.active_cycle),
        });
        self.bus
            .create_consumer(output_topics, collector, "orchestrator-consumer")
            .map_err(|err| OrchestratorError::Consumer(err.to_string()))?;
        self.bus
            .start_consuming("orchestrator-consumer")
            .map_err(|err| OrchestratorError::Consumer(err.to_string()))?;

        self.running.store(true, Ordering::SeqCst);

        let balances = {
            let wallet = self.lock_wallet();
            wallet.balances.clone()
        };
        self.bus.publish_event(
            "evolution-events",
            BusMessage::new("engine_initialized")
                .with_agent("orchestrator")
                .with_payload(json!({
                    "wallet_balance": balances,
                    "agents_spawned": registered
                        .iter()
                        .map(|(agent_id, _)| agent_id.clone())
                        .collect::<Vec<_>>(),
                })),
        );

        log::info!("evolution engine initialized");
        Ok(())
    }

    fn lock_wallet(&self) -> std::sync::MutexGuard<'_, Wallet> {
        match self.wallet.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_active_cycle(&self, cycle: Option<CycleRecord>) -> Option<CycleRecord> {
        let mut active = match self.active_cycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *active, cycle)
    }

    /// Run one complete evolution cycle and return its record.
    ///
    /// Phase failures are recorded in `errors` and never abort the cycle;
    /// the only exception is a financial hard halt.
    pub async fn run_evolution_cycle(&self) -> CycleRecord {
        let mut cycle = CycleRecord::new();
        log::info!("evolution cycle {} starting", cycle.cycle_id);
        self.set_active_cycle(Some(cycle.clone()));

        // Phase 0: financial assessment.
        let financial = self.phase_financial_assessment().await;
        let hard_halt = financial
            .get("hard_halt")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if let Some(runway) = financial.get("runway_days").and_then(Value::as_i64) {
            if runway < self.config.runway_alert_days {
                log::warn!("low runway: {} days", runway);
                self.send_summon_alert("LOW_RUNWAY", &financial);
            }
        }
        cycle.phases.insert("financial".to_string(), financial);

        if hard_halt {
            log::error!("financial phase declared a hard halt; cycle aborted");
            cycle
                .errors
                .push("financial hard halt declared by treasurer".to_string());
            return self.finish_cycle(cycle).await;
        }

        // Phase 1: audit.
        let proposals = match self.phase_audit().await {
            Some(audit) => {
                let proposals = audit
                    .get("proposals")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                cycle.phases.insert("audit".to_string(), audit);
                proposals
            }
            None => {
                log::warn!("audit phase produced no reply");
                cycle.phases.insert("audit".to_string(), Value::Null);
                Vec::new()
            }
        };
        cycle.proposals_generated = proposals.len() as u64;

        if !proposals.is_empty() {
            // Phase 2: review.
            let reviews = self.phase_review(&proposals).await;
            cycle
                .phases
                .insert("review".to_string(), Value::Array(reviews.clone()));

            // Phase 3: decisions.
            let decisions = self.phase_decide(&proposals, &reviews).await;
            let approved: Vec<Value> = proposals
                .iter()
                .filter(|proposal| {
                    proposal_id(proposal)
                        .and_then(|id| decisions.get(id))
                        .and_then(Value::as_str)
                        == Some("approved")
                })
                .cloned()
                .collect();
            cycle.proposals_approved = approved.len() as u64;
            cycle
                .phases
                .insert("decisions".to_string(), Value::Object(decisions));

            // Phase 4: implementation.
            if !approved.is_empty() {
                let implementations = self.phase_implement(&approved).await;
                cycle.implementations_successful = implementations
                    .iter()
                    .filter(|entry| entry.get("status").and_then(Value::as_str) == Some("success"))
                    .count() as u64;
                cycle
                    .phases
                    .insert("implementation".to_string(), Value::Array(implementations));
            } else {
                cycle
                    .phases
                    .insert("implementation".to_string(), Value::Array(Vec::new()));
            }
        } else {
            cycle.phases.insert("review".to_string(), Value::Array(Vec::new()));
            cycle
                .phases
                .insert("decisions".to_string(), Value::Object(serde_json::Map::new()));
            cycle
                .phases
                .insert("implementation".to_string(), Value::Array(Vec::new()));
        }

        // Phase 5: treasury update.
        match self.phase_treasury_update() {
            Ok(update) => {
                cycle.phases.insert("treasury".to_string(), update);
            }
            Err(err) => {
                log::error!("treasury update failed: {}", err);
                cycle.phases.insert("treasury".to_string(), Value::Null);
                cycle.errors.push(format!("treasury update failed: {}", err));
            }
        }

        self.finish_cycle(cycle).await
    }

    async fn finish_cycle(&self, mut cycle: CycleRecord) -> CycleRecord {
        // Give output traffic a beat to land, then fold the collector's
        // view of the cycle back into the record.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(observed) = self.set_active_cycle(None) {
            cycle.messages = observed.messages;
        }

        self.bus.publish_event(
            "evolution-events",
            BusMessage::new("evolution_cycle_completed")
                .with_agent("orchestrator")
                .with_payload(json!({
                    "cycle_id": cycle.cycle_id,
                    "summary": {
                        "proposals": cycle.proposals_generated,
                        "approved": cycle.proposals_approved,
                        "implemented": cycle.implementations_successful,
                        "errors": cycle.errors.len(),
                    },
                })),
        );

        log::info!(
            "cycle {} complete: {} proposals, {} approved, {} implemented",
            cycle.cycle_id,
            cycle.proposals_generated,
            cycle.proposals_approved,
            cycle.implementations_successful
        );

        let mut history = match self.cycle_history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push(cycle.clone());
        cycle
    }

    async fn phase_financial_assessment(&self) -> Value {
        log::info!("phase 0: financial assessment");
        let (balances, burn_rate) = {
            let wallet = self.lock_wallet();
            (wallet.balances.clone(), wallet.burn_rate_daily)
        };
        let request = BusMessage::new("financial_assessment")
            .with_agent("orchestrator")
            .with_payload(json!({ "wallet": balances, "burn_rate": burn_rate }));

        let reply = self
            .bus
            .request_reply(
                "treasurer-in",
                "treasurer-out",
                request,
                self.config.phase_timeout,
            )
            .await;

        if let Some(reply) = reply {
            if reply.payload.is_object() {
                return reply.payload;
            }
        }

        // No treasurer reply: compute runway locally.
        let wallet = self.lock_wallet();
        json!({
            "balance": wallet.usd_balance(),
            "burn_rate": wallet.burn_rate_daily,
            "runway_days": wallet.runway_days(),
            "priority_mode": if wallet.runway_days() < 30 { "CRITICAL_REVENUE" } else { "NORMAL" },
        })
    }

    async fn phase_audit(&self) -> Option<Value> {
        log::info!("phase 1: audit");
        let request = BusMessage::new("audit_request")
            .with_agent("orchestrator")
            .with_payload(json!({
                "scope": "full_system",
                "focus_areas": ["performance", "efficiency", "revenue_opportunities"],
            }));
        self.bus
            .request_reply("auditor-in", "auditor-out", request, self.config.phase_timeout)
            .await
            .map(|reply| reply.payload)
    }

    async fn phase_review(&self, proposals: &[Value]) -> Vec<Value> {
        log::info!("phase 2: review ({} proposals)", proposals.len());
        let mut reviews = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let request = BusMessage::new("review_request")
                .with_agent("orchestrator")
                .with_payload(json!({ "proposal": proposal }));
            let reply = self
                .bus
                .request_reply(
                    "reviewer-in",
                    "reviewer-out",
                    request,
                    self.config.phase_timeout,
                )
                .await;
            match reply {
                Some(reply) => reviews.push(reply.payload),
                None => {
                    log::warn!(
                        "no review reply for proposal {:?}",
                        proposal_id(proposal).unwrap_or("?")
                    );
                    reviews.push(Value::Null);
                }
            }
        }
        reviews
    }

    async fn phase_decide(
        &self,
        proposals: &[Value],
        reviews: &[Value],
    ) -> serde_json::Map<String, Value> {
        log::info!("phase 3: decisions");
        let mut decisions = serde_json::Map::new();
        for (index, proposal) in proposals.iter().enumerate() {
            let id = match proposal_id(proposal) {
                Some(id) => id.to_string(),
                None => {
                    log::warn!("proposal without id; skipping decision");
                    continue;
                }
            };
            let request = BusMessage::new("decision_request")
                .with_agent("orchestrator")
                .with_payload(json!({
                    "proposal": proposal,
                    "review": reviews.get(index).cloned().unwrap_or(Value::Null),
                }));
            let reply = self
                .bus
                .request_reply(
                    "architect-in",
                    "architect-out",
                    request,
                    self.config.phase_timeout,
                )
                .await;
            let decision = reply
                .and_then(|reply| reply.payload.get("decision").cloned())
                .unwrap_or(Value::Null);
            if decision.is_null() {
                log::warn!("no decision reply for proposal {}", id);
            }
            decisions.insert(id, decision);
        }
        decisions
    }

    async fn phase_implement(&self, approved: &[Value]) -> Vec<Value> {
        log::info!("phase 4: implementation ({} approved)", approved.len());
        let mut implementations = Vec::with_capacity(approved.len());
        for proposal in approved {
            let request = BusMessage::new("implementation_request")
                .with_agent("orchestrator")
                .with_payload(json!({ "proposal": proposal }));
            let reply = self
                .bus
                .request_reply(
                    "implementor-in",
                    "implementor-out",
                    request,
                    self.config.phase_timeout,
                )
                .await;
            match reply {
                Some(reply) => implementations.push(reply.payload),
                None => {
                    log::warn!(
                        "no implementation reply for proposal {:?}",
                        proposal_id(proposal).unwrap_or("?")
                    );
                    implementations.push(json!({
                        "proposal_id": proposal_id(proposal),
                        "status": "no_reply",
                    }));
                }
            }
        }
        implementations
    }

    fn phase_treasury_update(&self) -> std::io::Result<Value> {
        log::info!("phase 5: treasury update");
        let mut wallet = self.lock_wallet();
        let burn = wallet.burn_rate_daily;
        let balance = wallet.usd_balance() - burn;
        wallet.balances.insert("USD".to_string(), balance);
        wallet.save(&self.config.wallet_path)?;
        Ok(json!({
            "new_balance": balance,
            "burn_today": burn,
            "runway_days": wallet.runway_days(),
        }))
    }

    fn send_summon_alert(&self, urgency: &str, data: &Value) {
        let channel =
            std::env::var("SUMMON_CHANNEL").unwrap_or_else(|_| "ops@example.com".to_string());
        self.bus.publish_event(
            "evolution-events",
            BusMessage::new("summon_alert")
                .with_agent("orchestrator")
                .with_payload(json!({
                    "urgency": urgency,
                    "channel": channel,
                    "data": data,
                })),
        );
        log::warn!("SUMMON ALERT sent to {}: {}", channel, urgency);
    }

    /// Run cycles on a fixed cadence until [`shutdown`](Self::shutdown).
    pub async fn run_forever(&self, cadence: Duration) {
        log::info!("evolution engine running; cycles every {:?}", cadence);
        while self.running.load(Ordering::SeqCst) {
            self.run_evolution_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(cadence) => {}
                _ = self.shutdown.notified() => break,
            }
        }
    }

    /// Shut down: stop cycling, stop every agent, stop the monitor and the
    /// bus.
    pub async fn shutdown(&self) {
        log::info!("shutting down evolution engine");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        self.spawner.stop_all().await;
        if let Err(err) = self.bus.stop_consuming("orchestrator-consumer") {
            log::debug!("stopping orchestrator consumer: {}", err);
        }
        self.sentinel.stop_monitoring().await;
        self.bus.stop();
        log::info!("evolution engine shutdown complete");
    }
}

fn proposal_id(proposal: &Value) -> Option<&str> {
    proposal.get("id").and_then(Value::as_str)
}
