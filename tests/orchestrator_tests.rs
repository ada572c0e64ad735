use async_trait::async_trait;
use evoloop::bus::{BusMessage, MessageBus, MessageHandler};
use evoloop::config::SentinelConfig;
use evoloop::orchestrator::{
    EvolutionOrchestrator, OrchestratorConfig, Wallet, CANONICAL_AGENTS,
};
use evoloop::runtime::{AgentResult, EvolutionAgent, RuntimeConfig};
use evoloop::sentinel::CreditSentinel;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct StubAuditor;

#[async_trait]
impl EvolutionAgent for StubAuditor {
    async fn audit(&self, _message: &BusMessage) -> AgentResult {
        Ok(Some(json!({
            "status": "completed",
            "proposals": [
                {
                    "id": "prop_001",
                    "title": "Optimize embedder performance",
                    "type": "optimization",
                },
                {
                    "id": "prop_002",
                    "title": "Add caching layer",
                    "type": "enhancement",
                },
            ],
        })))
    }
}

struct StubReviewer;

#[async_trait]
impl EvolutionAgent for StubReviewer {
    async fn review(&self, message: &BusMessage) -> AgentResult {
        let id = message.payload["proposal"]["id"].clone();
        Ok(Some(json!({
            "proposal_id": id,
            "recommendation": "approve",
            "risk_level": "low",
        })))
    }
}

struct StubArchitect;

#[async_trait]
impl EvolutionAgent for StubArchitect {
    async fn decide(&self, message: &BusMessage) -> AgentResult {
        let id = message.payload["proposal"]["id"].clone();
        Ok(Some(json!({ "proposal_id": id, "decision": "approved" })))
    }
}

struct StubImplementor;

#[async_trait]
impl EvolutionAgent for StubImplementor {
    async fn implement(&self, message: &BusMessage) -> AgentResult {
        let id = message.payload["proposal"]["id"].clone();
        Ok(Some(json!({ "proposal_id": id, "status": "success" })))
    }
}

struct StubTreasurer {
    runway_days: i64,
    hard_halt: bool,
}

#[async_trait]
impl EvolutionAgent for StubTreasurer {
    async fn assess_finances(&self, _message: &BusMessage) -> AgentResult {
        Ok(Some(json!({
            "balance": 1000.0,
            "burn_rate": 10.0,
            "runway_days": self.runway_days,
            "priority_mode": "NORMAL",
            "hard_halt": self.hard_halt,
        })))
    }
}

struct EventCollector {
    messages: Mutex<Vec<BusMessage>>,
}

impl EventCollector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    fn find(&self, kind: &str) -> Option<BusMessage> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl MessageHandler for EventCollector {
    async fn handle(&self, message: BusMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

fn test_config(wallet_dir: &std::path::Path) -> OrchestratorConfig {
    let mut runtime = RuntimeConfig::default();
    runtime.health_interval_secs = 3600;
    OrchestratorConfig {
        wallet_path: wallet_dir.join("wallet.json"),
        phase_timeout: Duration::from_secs(2),
        runway_alert_days: 60,
        runtime,
    }
}

fn register_stubs(orchestrator: &EvolutionOrchestrator, runway_days: i64, hard_halt: bool) {
    orchestrator.register_agent("auditor", Arc::new(StubAuditor));
    orchestrator.register_agent("reviewer", Arc::new(StubReviewer));
    orchestrator.register_agent("architect", Arc::new(StubArchitect));
    orchestrator.register_agent("implementor", Arc::new(StubImplementor));
    orchestrator.register_agent(
        "treasurer",
        Arc::new(StubTreasurer {
            runway_days,
            hard_halt,
        }),
    );
}

async fn watch_events(bus: &Arc<MessageBus>) -> Arc<EventCollector> {
    let collector = EventCollector::new();
    bus.create_consumer(
        vec!["evolution-events".to_string()],
        Arc::clone(&collector) as Arc<dyn MessageHandler>,
        "event-watcher",
    )
    .unwrap();
    bus.start_consuming("event-watcher").unwrap();
    collector
}

#[tokio::test]
async fn full_cycle_smoke() {
    let dir = tempfile::tempdir().unwrap();
    Wallet {
        balances: [("USD".to_string(), 500.0)].into_iter().collect(),
        burn_rate_daily: 10.0,
    }
    .save(&dir.path().join("wallet.json"))
    .unwrap();

    let orchestrator =
        EvolutionOrchestrator::new(SentinelConfig::default(), test_config(dir.path()));
    register_stubs(&orchestrator, 100, false);

    let events = watch_events(&orchestrator.bus()).await;
    orchestrator.initialize().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let initialized = events.find("engine_initialized").expect("init event");
    let spawned = initialized.payload["agents_spawned"].as_array().unwrap();
    assert_eq!(spawned.len(), CANONICAL_AGENTS.len());

    let record = orchestrator.run_evolution_cycle().await;

    for phase in [
        "financial",
        "audit",
        "review",
        "decisions",
        "implementation",
        "treasury",
    ] {
        assert!(record.phases.contains_key(phase), "missing phase {}", phase);
        assert!(
            !record.phases[phase].is_null(),
            "phase {} should have a result",
            phase
        );
    }
    assert!(record.proposals_generated >= 1);
    assert_eq!(record.proposals_generated, 2);
    assert_eq!(record.proposals_approved, 2);
    assert_eq!(record.implementations_successful, 2);
    assert!(record.errors.is_empty());
    assert!(
        !record.messages.is_empty(),
        "output consumer should have observed agent traffic"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let completed = events
        .find("evolution_cycle_completed")
        .expect("completion event");
    assert_eq!(completed.payload["cycle_id"], record.cycle_id.as_str());
    assert_eq!(completed.payload["summary"]["proposals"], 2);
    assert_eq!(completed.payload["summary"]["implemented"], 2);

    assert_eq!(orchestrator.cycle_history().len(), 1);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn treasury_phase_persists_the_burn() {
    let dir = tempfile::tempdir().unwrap();
    let wallet_path = dir.path().join("wallet.json");
    Wallet {
        balances: [("USD".to_string(), 200.0)].into_iter().collect(),
        burn_rate_daily: 25.0,
    }
    .save(&wallet_path)
    .unwrap();

    let orchestrator =
        EvolutionOrchestrator::new(SentinelConfig::default(), test_config(dir.path()));
    register_stubs(&orchestrator, 100, false);
    orchestrator.initialize().await.unwrap();

    let record = orchestrator.run_evolution_cycle().await;
    assert_eq!(record.phases["treasury"]["new_balance"], 175.0);
    assert_eq!(record.phases["treasury"]["burn_today"], 25.0);

    let reloaded = Wallet::load(&wallet_path);
    assert!((reloaded.usd_balance() - 175.0).abs() < 1e-9);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn low_runway_emits_summon_alert() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        EvolutionOrchestrator::new(SentinelConfig::default(), test_config(dir.path()));
    register_stubs(&orchestrator, 10, false);

    let events = watch_events(&orchestrator.bus()).await;
    orchestrator.initialize().await.unwrap();
    orchestrator.run_evolution_cycle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let alert = events.find("summon_alert").expect("summon alert");
    assert_eq!(alert.payload["urgency"], "LOW_RUNWAY");
    assert_eq!(alert.payload["data"]["runway_days"], 10);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn financial_hard_halt_aborts_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        EvolutionOrchestrator::new(SentinelConfig::default(), test_config(dir.path()));
    register_stubs(&orchestrator, 100, true);
    orchestrator.initialize().await.unwrap();

    let record = orchestrator.run_evolution_cycle().await;
    assert!(record.phases.contains_key("financial"));
    assert!(!record.phases.contains_key("audit"), "halt skips later phases");
    assert!(!record.phases.contains_key("treasury"));
    assert!(!record.errors.is_empty());
    assert_eq!(record.proposals_generated, 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn missing_agent_leaves_phase_null() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.phase_timeout = Duration::from_millis(200);

    let orchestrator = EvolutionOrchestrator::new(SentinelConfig::default(), config);
    // Treasurer only: audit/review/decide/implement have nobody listening.
    orchestrator.register_agent(
        "treasurer",
        Arc::new(StubTreasurer {
            runway_days: 100,
            hard_halt: false,
        }),
    );
    orchestrator.initialize().await.unwrap();

    let record = orchestrator.run_evolution_cycle().await;
    assert!(record.phases["audit"].is_null(), "missing reply records null");
    assert_eq!(record.proposals_generated, 0);
    // The cycle still ran to completion.
    assert!(record.phases.contains_key("treasury"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn spawned_runtimes_use_sentinel_credit_caps() {
    let dir = tempfile::tempdir().unwrap();
    let mut sentinel_config = SentinelConfig::default();
    sentinel_config
        .agent_caps
        .insert("treasurer".to_string(), 123);
    let bus = Arc::new(MessageBus::new());
    let sentinel = Arc::new(CreditSentinel::new(sentinel_config));

    let orchestrator = EvolutionOrchestrator::with_parts(
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        test_config(dir.path()),
    );
    orchestrator.register_agent(
        "treasurer",
        Arc::new(StubTreasurer {
            runway_days: 100,
            hard_halt: false,
        }),
    );
    orchestrator.initialize().await.unwrap();

    let health = orchestrator.get_all_health().await;
    assert_eq!(health["treasurer"].credit_limit, 123);

    orchestrator.shutdown().await;
}
