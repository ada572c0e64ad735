use async_trait::async_trait;
use evoloop::bus::{BusMessage, MessageBus, MessageHandler};
use evoloop::config::SentinelConfig;
use evoloop::runtime::{route_for, AgentResult, AgentRuntime, Capability, EchoAgent, EvolutionAgent, RuntimeConfig};
use evoloop::sentinel::CreditSentinel;
use evoloop::spawner::AgentSpawner;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Collector {
    messages: Mutex<Vec<BusMessage>>,
}

impl Collector {
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

    fn count(&self, kind: &str) -> usize {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .count()
    }
}

#[async_trait]
impl MessageHandler for Collector {
    async fn handle(&self, message: BusMessage) {
        self.messages.lock().unwrap().push(message);
    }
}

/// Agent whose handler always fails.
struct FailingAgent;

#[async_trait]
impl EvolutionAgent for FailingAgent {
    async fn process_message(&self, _message: &BusMessage) -> AgentResult {
        Err("synthetic handler failure".into())
    }
}

fn harness() -> (Arc<MessageBus>, Arc<CreditSentinel>) {
    (
        Arc::new(MessageBus::new()),
        Arc::new(CreditSentinel::new(SentinelConfig::default())),
    )
}

async fn watch_output(bus: &Arc<MessageBus>, agent_id: &str) -> Arc<Collector> {
    let collector = Collector::new();
    bus.create_consumer(
        vec![format!("{}-out", agent_id)],
        Arc::clone(&collector) as Arc<dyn MessageHandler>,
        format!("{}-watcher", agent_id),
    )
    .unwrap();
    bus.start_consuming(&format!("{}-watcher", agent_id)).unwrap();
    collector
}

#[test]
fn routing_table_covers_the_capability_set() {
    assert_eq!(route_for("audit_request"), Some(Capability::Audit));
    assert_eq!(route_for("review_request"), Some(Capability::Review));
    assert_eq!(route_for("decision_request"), Some(Capability::Decide));
    assert_eq!(
        route_for("implementation_request"),
        Some(Capability::Implement)
    );
    assert_eq!(
        route_for("financial_assessment"),
        Some(Capability::AssessFinances)
    );
    assert_eq!(route_for("proposal"), Some(Capability::ProcessProposal));
    assert_eq!(route_for("ping"), Some(Capability::Ping));
    assert_eq!(route_for("mystery"), None);
}

#[tokio::test]
async fn ping_round_trip_with_standard_response_envelope() {
    let (bus, sentinel) = harness();
    let collector = watch_output(&bus, "echo").await;

    let runtime = AgentRuntime::new(
        "echo",
        Arc::new(EchoAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    let ping = BusMessage::new("ping")
        .with_correlation_id("corr-42")
        .with_payload(json!({"data": "hello"}));
    bus.publish_event("echo-in", ping);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let started = collector.find("agent_started").expect("agent_started event");
    assert_eq!(started.agent.as_deref(), Some("echo"));

    let response = collector.find("ping_response").expect("ping response");
    assert_eq!(response.agent.as_deref(), Some("echo"));
    assert_eq!(response.correlation_id.as_deref(), Some("corr-42"));
    assert_eq!(response.payload, json!({"echo": "hello"}));

    runtime.stop().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(collector.find("agent_stopped").is_some());
}

#[tokio::test]
async fn handler_error_becomes_error_event() {
    let (bus, sentinel) = harness();
    let collector = watch_output(&bus, "flaky").await;

    let runtime = AgentRuntime::new(
        "flaky",
        Arc::new(FailingAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    bus.publish_event("flaky-in", BusMessage::new("ping").with_payload(json!({"x": 1})));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let error = collector.find("error").expect("error event");
    assert!(error.payload["error"]
        .as_str()
        .unwrap()
        .contains("synthetic handler failure"));
    assert_eq!(error.payload["original_message"]["kind"], "ping");

    // The runtime keeps going after a handler error.
    assert!(runtime.is_running());
    runtime.stop().await;
}

#[tokio::test]
async fn local_credit_limit_drops_messages() {
    let (bus, sentinel) = harness();
    let collector = watch_output(&bus, "thrifty").await;

    let mut config = RuntimeConfig::default();
    config.credit_limit = 10;
    config.default_estimated_credits = 10;

    let runtime = AgentRuntime::new(
        "thrifty",
        Arc::new(EchoAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        config,
    );
    runtime.start().await.unwrap();

    bus.publish_event("thrifty-in", BusMessage::new("ping").with_payload(json!({"data": 1})));
    tokio::time::sleep(Duration::from_millis(100)).await;
    bus.publish_event("thrifty-in", BusMessage::new("ping").with_payload(json!({"data": 2})));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(collector.count("ping_response"), 1);
    let exceeded = collector
        .find("credit_limit_exceeded")
        .expect("credit_limit_exceeded event");
    assert_eq!(exceeded.payload["limit"], 10);

    runtime.stop().await;
}

#[tokio::test]
async fn sentinel_abort_stops_dispatch() {
    let bus = Arc::new(MessageBus::new());
    let mut sentinel_config = SentinelConfig::default();
    sentinel_config.agent_caps.insert("capped".to_string(), 15);
    let sentinel = Arc::new(CreditSentinel::new(sentinel_config));
    let collector = watch_output(&bus, "capped").await;

    let runtime = AgentRuntime::new(
        "capped",
        Arc::new(EchoAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    // 10 credits each; the second call hits the 15-credit cap and aborts.
    for n in 0..4 {
        bus.publish_event("capped-in", BusMessage::new("ping").with_payload(json!({"data": n})));
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    assert_eq!(collector.count("ping_response"), 1);
    assert!(collector.find("credit_limit_exceeded").is_some());
    assert_eq!(
        sentinel.agent_status("capped"),
        Some(evoloop::sentinel::AgentStatus::Aborted)
    );

    runtime.stop().await;
}

#[tokio::test]
async fn unroutable_kind_falls_back_to_process_message() {
    let (bus, sentinel) = harness();
    let collector = watch_output(&bus, "echo2").await;

    let runtime = AgentRuntime::new(
        "echo2",
        Arc::new(EchoAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    bus.publish_event("echo2-in", BusMessage::new("mystery_kind"));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = collector
        .find("mystery_kind_response")
        .expect("fallback response");
    assert_eq!(response.payload, json!({"original_kind": "mystery_kind"}));

    runtime.stop().await;
}

#[tokio::test]
async fn health_snapshot_tracks_usage() {
    let (bus, sentinel) = harness();
    let runtime = AgentRuntime::new(
        "healthy",
        Arc::new(EchoAgent),
        Arc::clone(&bus),
        Arc::clone(&sentinel),
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    bus.publish_event("healthy-in", BusMessage::new("ping").with_payload(json!({"data": 1})));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let health = runtime.get_health();
    assert!(health.running);
    assert!(!health.degraded);
    assert_eq!(health.messages_processed, 1);
    assert_eq!(health.credits_used, 10);
    assert!((health.credit_usage_percent - 1.0).abs() < f64::EPSILON);
    assert!(health.bus.is_healthy());

    runtime.stop().await;
    assert!(!runtime.get_health().running);
}

#[tokio::test]
async fn run_forever_returns_after_stop() {
    let (bus, sentinel) = harness();
    let runtime = AgentRuntime::new(
        "transient",
        Arc::new(EchoAgent),
        bus,
        sentinel,
        RuntimeConfig::default(),
    );
    runtime.start().await.unwrap();

    let waiter = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run_forever().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.stop().await;

    tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("run_forever must return within the grace period")
        .unwrap();
}

#[tokio::test]
async fn spawner_is_idempotent_and_stops_all() {
    let (bus, sentinel) = harness();
    let spawner = AgentSpawner::new(Arc::clone(&bus), Arc::clone(&sentinel));

    let first = spawner
        .spawn_agent("worker", Arc::new(EchoAgent), RuntimeConfig::default())
        .await
        .unwrap();
    let second = spawner
        .spawn_agent("worker", Arc::new(EchoAgent), RuntimeConfig::default())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second), "spawn is idempotent by id");

    spawner
        .spawn_agent("other", Arc::new(EchoAgent), RuntimeConfig::default())
        .await
        .unwrap();

    let health = spawner.get_all_health().await;
    assert_eq!(health.len(), 2);
    assert!(health["worker"].running);

    spawner.stop_all().await;
    assert!(spawner.agent_ids().await.is_empty());
    assert!(!first.is_running());
}
