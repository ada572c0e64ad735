//! Agent Runtime — couples one agent to the bus and enforces the sentinel.
//!
//! An [`AgentRuntime`] wraps a single [`EvolutionAgent`], consumes the
//! agent's input topic (`<agent>-in`), routes each message to the matching
//! capability method, envelopes the return value in a standard response, and
//! publishes it on the output topic (`<agent>-out`). Every dispatch passes
//! through the [`CreditSentinel`] first; `abort` stops dispatching, and
//! `throttle` delays it.
//!
//! # Message flow
//!
//! ```text
//! <agent>-in ──▶ sentinel admission ──▶ routing table ──▶ capability method
//!                      │ abort/limit            │ no route
//!                      ▼                        ▼
//!         credit_limit_exceeded event   process_message fallback
//!                                               │
//!                          response (<kind>_response) ──▶ <agent>-out
//! ```
//!
//! Responses to messages from the same topic are published in arrival order;
//! nothing is guaranteed across agents.
//!
//! # Example
//!
//! ```rust,no_run
//! use evoloop::bus::MessageBus;
//! use evoloop::config::SentinelConfig;
//! use evoloop::runtime::{AgentRuntime, EchoAgent, RuntimeConfig};
//! use evoloop::sentinel::CreditSentinel;
//! use std::sync::Arc;
//!
//! # async {
//! let bus = Arc::new(MessageBus::new());
//! let sentinel = Arc::new(CreditSentinel::new(SentinelConfig::default()));
//!
//! let runtime = AgentRuntime::new(
//!     "echo",
//!     Arc::new(EchoAgent),
//!     Arc::clone(&bus),
//!     Arc::clone(&sentinel),
//!     RuntimeConfig::default(),
//! );
//! runtime.start().await.unwrap();
//! runtime.run_forever().await;
//! # };
//! ```

use crate::evoloop::bus::{BusError, BusHealth, BusMessage, MessageBus, MessageHandler};
use crate::evoloop::sentinel::{AgentStatus, CreditSentinel, Verdict};
use async_trait::async_trait;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Result of a capability method: an optional response payload, or an error
/// that the runtime converts into an `error` event.
pub type AgentResult = Result<Option<serde_json::Value>, Box<dyn Error + Send + Sync>>;

/// The capability set an agent can implement.
///
/// Every capability has a default implementation that delegates to
/// [`process_message`](EvolutionAgent::process_message), whose own default
/// returns `Ok(None)` — the runtime logs and drops such messages. Agents
/// override only what they support.
#[async_trait]
pub trait EvolutionAgent: Send + Sync {
    /// Handle an `audit_request`.
    async fn audit(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle a `review_request`.
    async fn review(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle a `decision_request`.
    async fn decide(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle an `implementation_request`.
    async fn implement(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle a `financial_assessment` request.
    async fn assess_finances(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle a raw `proposal` message.
    async fn process_proposal(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Handle a `ping`.
    async fn handle_ping(&self, message: &BusMessage) -> AgentResult {
        self.process_message(message).await
    }

    /// Generic fallback for kinds with no route or no specific handler.
    async fn process_message(&self, _message: &BusMessage) -> AgentResult {
        Ok(None)
    }
}

/// A routed capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Audit,
    Review,
    Decide,
    Implement,
    AssessFinances,
    ProcessProposal,
    Ping,
}

lazy_static! {
    /// Static routing table from message kind to capability.
    static ref ROUTES: HashMap<&'static str, Capability> = {
        let mut routes = HashMap::new();
        routes.insert("audit_request", Capability::Audit);
        routes.insert("review_request", Capability::Review);
        routes.insert("decision_request", Capability::Decide);
        routes.insert("implementation_request", Capability::Implement);
        routes.insert("financial_assessment", Capability::AssessFinances);
        routes.insert("proposal", Capability::ProcessProposal);
        routes.insert("ping", Capability::Ping);
        routes
    };
}

/// Look up the capability routed for a message kind.
pub fn route_for(kind: &str) -> Option<Capability> {
    ROUTES.get(kind).copied()
}

/// Per-runtime tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime-local credit ceiling; at or past it, incoming messages are
    /// dropped with a `credit_limit_exceeded` event.
    pub credit_limit: u64,

    /// Credits assumed for a message whose payload carries no
    /// `estimated_credits` field.
    pub default_estimated_credits: u64,

    /// Seconds between `health_check` events.
    pub health_interval_secs: u64,

    /// Delay applied after a `throttle` verdict before the next dispatch.
    pub throttle_backoff_ms: u64,

    /// Bound on how long `stop()` waits for in-flight messages to drain.
    pub grace_period_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            credit_limit: 1000,
            default_estimated_credits: 10,
            health_interval_secs: 30,
            throttle_backoff_ms: 250,
            grace_period_ms: 5000,
        }
    }
}

/// Health snapshot for one runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    pub agent_id: String,
    pub running: bool,
    pub degraded: bool,
    pub messages_processed: u64,
    pub credits_used: u64,
    pub credit_limit: u64,
    pub credit_usage_percent: f64,
    pub bus: BusHealth,
}

/// Startup and lifecycle failures for a runtime.
#[derive(Debug)]
pub enum RuntimeError {
    /// The sentinel refused to admit the agent at startup.
    AdmissionDenied(String),
    /// Subscribing the input consumer failed.
    Bus(BusError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AdmissionDenied(agent) => {
                write!(f, "sentinel denied admission for agent {}", agent)
            }
            RuntimeError::Bus(err) => write!(f, "bus error: {}", err),
        }
    }
}

impl Error for RuntimeError {}

impl From<BusError> for RuntimeError {
    fn from(err: BusError) -> Self {
        RuntimeError::Bus(err)
    }
}

/// Execution shell for one agent: input consumer, sentinel enforcement,
/// routing, response publication, and the periodic health loop.
pub struct AgentRuntime {
    agent_id: String,
    input_topic: String,
    output_topic: String,
    agent: Arc<dyn EvolutionAgent>,
    bus: Arc<MessageBus>,
    sentinel: Arc<CreditSentinel>,
    config: RuntimeConfig,
    consumer_id: String,
    running: AtomicBool,
    dispatching: AtomicBool,
    degraded: AtomicBool,
    messages_processed: AtomicU64,
    in_flight: AtomicU64,
    health_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Notify,
}

struct InputHandler {
    runtime: Arc<AgentRuntime>,
}

#[async_trait]
impl MessageHandler for InputHandler {
    async fn handle(&self, message: BusMessage) {
        self.runtime.handle_message(message).await;
    }
}

impl AgentRuntime {
    /// Create a runtime for `agent_id`. Topics are derived as
    /// `<agent_id>-in` / `<agent_id>-out`. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(
        agent_id: impl Into<String>,
        agent: Arc<dyn EvolutionAgent>,
        bus: Arc<MessageBus>,
        sentinel: Arc<CreditSentinel>,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let agent_id = agent_id.into();
        Arc::new(Self {
            input_topic: format!("{}-in", agent_id),
            output_topic: format!("{}-out", agent_id),
            consumer_id: format!("{}-consumer", agent_id),
            agent_id,
            agent,
            bus,
            sentinel,
            config,
            running: AtomicBool::new(false),
            dispatching: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            messages_processed: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            health_task: tokio::sync::Mutex::new(None),
            shutdown: Notify::new(),
        })
    }

    /// Agent id this runtime wraps.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Input topic (`<agent>-in`).
    pub fn input_topic(&self) -> &str {
        &self.input_topic
    }

    /// Output topic (`<agent>-out`).
    pub fn output_topic(&self) -> &str {
        &self.output_topic
    }

    /// Whether the runtime is started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the runtime: sentinel admission, input subscription, health
    /// loop, and the `agent_started` event. Subscription failure is fatal
    /// and tears the partial registration down.
    pub async fn start(self: &Arc<Self>) -> Result<(), RuntimeError> {
        log::info!("starting agent runtime for {}", self.agent_id);

        if self.sentinel.track_agent_start(&self.agent_id) == Verdict::Abort {
            return Err(RuntimeError::AdmissionDenied(self.agent_id.clone()));
        }

        let handler = Arc::new(InputHandler {
            runtime: Arc::clone(self),
        });
        self.bus
            .create_consumer(vec![self.input_topic.clone()], handler, self.consumer_id.as_str())?;
        if let Err(err) = self.bus.start_consuming(&self.consumer_id) {
            let _ = self.bus.stop_consuming(&self.consumer_id);
            return Err(err.into());
        }

        self.running.store(true, Ordering::SeqCst);
        self.dispatching.store(true, Ordering::SeqCst);

        let runtime = Arc::clone(self);
        *self.health_task.lock().await = Some(tokio::spawn(async move {
            let interval = Duration::from_secs(runtime.config.health_interval_secs.max(1));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let health = runtime.get_health();
                        let event = BusMessage::new("health_check")
                            .with_agent(&runtime.agent_id)
                            .with_payload(json!({
                                "status": if health.running { "healthy" } else { "stopped" },
                                "metrics": health,
                            }));
                        runtime.publish_with_retry(&runtime.output_topic, event).await;
                    }
                    _ = runtime.shutdown.notified() => break,
                }
            }
        }));

        let started = BusMessage::new("agent_started")
            .with_agent(&self.agent_id)
            .with_payload(json!({ "config": self.config }));
        self.publish_with_retry(&self.output_topic, started).await;

        log::info!("agent {} started", self.agent_id);
        Ok(())
    }

    /// Stop the runtime: cancel the health loop, drain in-flight work up to
    /// the grace period, publish `agent_stopped`, and stop the consumer.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("stopping agent {}", self.agent_id);
        self.dispatching.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        if let Some(task) = self.health_task.lock().await.take() {
            let grace = Duration::from_millis(self.config.grace_period_ms);
            if tokio::time::timeout(grace, task).await.is_err() {
                log::warn!("health loop for {} missed the grace period", self.agent_id);
            }
        }

        // Bounded drain of the message currently in the handler.
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.grace_period_ms);
        while self.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stopped = BusMessage::new("agent_stopped")
            .with_agent(&self.agent_id)
            .with_payload(json!({
                "messages_processed": self.messages_processed.load(Ordering::SeqCst),
                "credits_used": self.sentinel.credits_used(&self.agent_id),
            }));
        self.publish_with_retry(&self.output_topic, stopped).await;

        if let Err(err) = self.bus.stop_consuming(&self.consumer_id) {
            log::debug!("stop_consuming for {}: {}", self.agent_id, err);
        }
        self.sentinel.mark_idle(&self.agent_id);
        log::info!("agent {} stopped", self.agent_id);
    }

    /// Block until a ctrl-c signal or an explicit [`stop`](Self::stop).
    pub async fn run_forever(self: &Arc<Self>) {
        log::info!("agent {} running; ctrl-c to stop", self.agent_id);
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    log::error!("signal handler failed: {}", err);
                }
            }
            _ = self.shutdown.notified() => {}
        }
        if self.is_running() {
            self.stop().await;
        }
    }

    /// Current health snapshot.
    pub fn get_health(&self) -> RuntimeHealth {
        let credits_used = self.sentinel.credits_used(&self.agent_id);
        let limit = self.config.credit_limit;
        RuntimeHealth {
            agent_id: self.agent_id.clone(),
            running: self.is_running(),
            degraded: self.degraded.load(Ordering::SeqCst),
            messages_processed: self.messages_processed.load(Ordering::SeqCst),
            credits_used,
            credit_limit: limit,
            credit_usage_percent: if limit > 0 {
                credits_used as f64 / limit as f64 * 100.0
            } else {
                0.0
            },
            bus: self.bus.health_check(),
        }
    }

    async fn handle_message(self: &Arc<Self>, message: BusMessage) {
        if !self.dispatching.load(Ordering::SeqCst) {
            return;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.messages_processed.fetch_add(1, Ordering::SeqCst);
        self.process(message).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn process(self: &Arc<Self>, message: BusMessage) {
        log::debug!("agent {} processing {}", self.agent_id, message.kind);

        if self.sentinel.agent_status(&self.agent_id) == Some(AgentStatus::Aborted) {
            log::warn!("agent {} is aborted; dropping {}", self.agent_id, message.kind);
            self.dispatching.store(false, Ordering::SeqCst);
            return;
        }

        let credits_used = self.sentinel.credits_used(&self.agent_id);
        if credits_used >= self.config.credit_limit {
            self.publish_credit_limit_exceeded(credits_used).await;
            return;
        }

        let credits = message
            .payload
            .get("estimated_credits")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.config.default_estimated_credits);
        let tokens = credits * 100;

        match self
            .sentinel
            .track_tool_call(&self.agent_id, &message.kind, credits, tokens)
        {
            Verdict::Abort => {
                self.publish_credit_limit_exceeded(self.sentinel.credits_used(&self.agent_id))
                    .await;
                self.dispatching.store(false, Ordering::SeqCst);
                return;
            }
            Verdict::Throttle => {
                log::warn!("agent {} throttled; backing off", self.agent_id);
                tokio::time::sleep(Duration::from_millis(self.config.throttle_backoff_ms)).await;
            }
            Verdict::Warn => {
                log::warn!("agent {} nearing its credit cap", self.agent_id);
            }
            Verdict::Checkpoint | Verdict::Allow => {}
        }

        let result = match route_for(&message.kind) {
            Some(capability) => self.dispatch(capability, &message).await,
            None => {
                log::debug!(
                    "no route for {} on agent {}; trying process_message",
                    message.kind,
                    self.agent_id
                );
                self.agent.process_message(&message).await
            }
        };

        match result {
            Ok(Some(payload)) => {
                // Outputs of an agent aborted mid-flight are discarded.
                if self.sentinel.agent_status(&self.agent_id) == Some(AgentStatus::Aborted) {
                    log::warn!(
                        "discarding output of aborted agent {} for {}",
                        self.agent_id,
                        message.kind
                    );
                    return;
                }
                let response = message.reply(&self.agent_id, payload);
                self.publish_with_retry(&self.output_topic, response).await;
            }
            Ok(None) => {
                log::debug!(
                    "agent {} produced no response for {}",
                    self.agent_id,
                    message.kind
                );
            }
            Err(err) => {
                log::error!(
                    "handler error in agent {} for {}: {}",
                    self.agent_id,
                    message.kind,
                    err
                );
                let event = BusMessage::new("error")
                    .with_agent(&self.agent_id)
                    .with_payload(json!({
                        "error": err.to_string(),
                        "original_message": message,
                    }));
                self.publish_with_retry(&self.output_topic, event).await;
            }
        }
    }

    async fn dispatch(&self, capability: Capability, message: &BusMessage) -> AgentResult {
        match capability {
            Capability::Audit => self.agent.audit(message).await,
            Capability::Review => self.agent.review(message).await,
            Capability::Decide => self.agent.decide(message).await,
            Capability::Implement => self.agent.implement(message).await,
            Capability::AssessFinances => self.agent.assess_finances(message).await,
            Capability::ProcessProposal => self.agent.process_proposal(message).await,
            Capability::Ping => self.agent.handle_ping(message).await,
        }
    }

    async fn publish_credit_limit_exceeded(&self, credits_used: u64) {
        log::warn!("agent {} exceeded its credit budget", self.agent_id);
        let event = BusMessage::new("credit_limit_exceeded")
            .with_agent(&self.agent_id)
            .with_payload(json!({
                "credits_used": credits_used,
                "limit": self.config.credit_limit,
            }));
        self.publish_with_retry(&self.output_topic, event).await;
    }

    /// Publish with exponential backoff. After the retry ceiling the
    /// runtime enters a degraded state and ceases publishing entirely.
    async fn publish_with_retry(&self, topic: &str, message: BusMessage) -> bool {
        if self.degraded.load(Ordering::SeqCst) {
            log::debug!("agent {} degraded; not publishing {}", self.agent_id, message.kind);
            return false;
        }
        let mut delay = Duration::from_millis(100);
        for attempt in 0..5 {
            if self.bus.publish_event(topic, message.clone()) {
                return true;
            }
            log::warn!(
                "publish attempt {} to {} failed for agent {}",
                attempt + 1,
                topic,
                self.agent_id
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
        log::error!(
            "agent {} exhausted publish retries to {}; entering degraded state",
            self.agent_id,
            topic
        );
        self.degraded.store(true, Ordering::SeqCst);
        false
    }
}

/// Minimal agent used to validate a runtime end to end: answers pings with
/// pongs and echoes everything else.
pub struct EchoAgent;

#[async_trait]
impl EvolutionAgent for EchoAgent {
    async fn handle_ping(&self, message: &BusMessage) -> AgentResult {
        Ok(Some(json!({
            "echo": message.payload.get("data").cloned().unwrap_or(serde_json::Value::Null),
        })))
    }

    async fn process_message(&self, message: &BusMessage) -> AgentResult {
        Ok(Some(json!({ "original_kind": message.kind })))
    }
}
