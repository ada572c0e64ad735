use evoloop::config::SentinelConfig;
use evoloop::sentinel::{AgentStatus, CreditSentinel, Verdict};
use std::sync::Arc;

fn config_with_caps(
    global_hard_cap: u64,
    checkpoint_interval: u64,
    caps: &[(&str, u64)],
) -> SentinelConfig {
    let mut config = SentinelConfig::default();
    config.global_hard_cap = global_hard_cap;
    config.checkpoint_interval = checkpoint_interval;
    for (agent, cap) in caps {
        config.agent_caps.insert(agent.to_string(), *cap);
    }
    config
}

#[test]
fn admission_cascade_allow_warn_throttle_abort() {
    let sentinel = CreditSentinel::new(config_with_caps(100, 10, &[("test-agent", 50)]));

    assert_eq!(sentinel.track_agent_start("test-agent"), Verdict::Allow);
    assert_eq!(
        sentinel.track_tool_call("test-agent", "tool1", 35, 3500),
        Verdict::Allow
    );
    assert_eq!(
        sentinel.track_tool_call("test-agent", "tool2", 5, 500),
        Verdict::Warn
    );
    assert_eq!(
        sentinel.track_tool_call("test-agent", "tool3", 5, 500),
        Verdict::Throttle
    );
    assert_eq!(
        sentinel.track_tool_call("test-agent", "tool4", 5, 500),
        Verdict::Abort
    );
    assert_eq!(
        sentinel.agent_status("test-agent"),
        Some(AgentStatus::Aborted)
    );
}

#[test]
fn global_hard_cap_aborts_third_agent() {
    let sentinel = CreditSentinel::new(config_with_caps(100, 50, &[]));

    assert_eq!(
        sentinel.track_tool_call("alpha", "tool", 60, 0),
        Verdict::Allow
    );
    assert_eq!(
        sentinel.track_tool_call("beta", "tool", 35, 0),
        Verdict::Allow
    );
    assert_eq!(
        sentinel.track_tool_call("gamma", "tool", 10, 0),
        Verdict::Abort
    );

    let snapshot = sentinel.get_metrics();
    assert_eq!(snapshot.global.total_credits, 105);
}

#[test]
fn boundary_verdicts_at_cap_fractions() {
    // Large checkpoint interval keeps the checkpoint rule out of the way.
    let sentinel = CreditSentinel::new(config_with_caps(10_000, 10_000, &[("b-agent", 100)]));

    assert_eq!(
        sentinel.track_tool_call("b-agent", "tool", 80, 0),
        Verdict::Warn,
        "exactly 0.8*cap must warn"
    );
    assert_eq!(
        sentinel.track_tool_call("b-agent", "tool", 10, 0),
        Verdict::Throttle,
        "exactly 0.9*cap must throttle"
    );
    assert_eq!(
        sentinel.track_tool_call("b-agent", "tool", 10, 0),
        Verdict::Abort,
        "exactly cap must abort"
    );
}

#[test]
fn checkpoint_every_interval() {
    let sentinel = CreditSentinel::new(config_with_caps(10_000, 10, &[("cp-agent", 1000)]));

    assert_eq!(
        sentinel.track_tool_call("cp-agent", "tool", 10, 100),
        Verdict::Checkpoint
    );
    assert_eq!(
        sentinel.track_tool_call("cp-agent", "tool", 5, 50),
        Verdict::Allow
    );
    assert_eq!(
        sentinel.track_tool_call("cp-agent", "tool", 5, 50),
        Verdict::Checkpoint
    );

    let snapshot = sentinel.get_metrics();
    let metrics = &snapshot.agents["cp-agent"];
    assert_eq!(metrics.checkpoints.len(), 2);
    assert!(metrics.last_checkpoint.is_some());
    assert_eq!(metrics.checkpoints[1].credits, 20);
}

#[test]
fn aborted_agent_never_allowed_again() {
    let sentinel = CreditSentinel::new(config_with_caps(1000, 50, &[("doomed", 10)]));

    assert_eq!(
        sentinel.track_tool_call("doomed", "tool", 10, 0),
        Verdict::Abort
    );
    // Terminal: every further admission is an abort and counters freeze.
    for _ in 0..5 {
        assert_eq!(
            sentinel.track_tool_call("doomed", "tool", 1, 0),
            Verdict::Abort
        );
    }
    assert_eq!(sentinel.credits_used("doomed"), 10);
    assert_eq!(sentinel.track_agent_start("doomed"), Verdict::Abort);
}

#[test]
fn abort_is_idempotent() {
    let sentinel = CreditSentinel::new(SentinelConfig::default());
    sentinel.track_agent_start("once");
    sentinel.abort_agent("once", "first");
    sentinel.abort_agent("once", "second");

    let snapshot = sentinel.get_metrics();
    assert_eq!(snapshot.global.aborted_agents, 1);
    assert_eq!(snapshot.global.active_agents, 0);
}

#[test]
fn lock_acquire_is_idempotent_for_holder() {
    let sentinel = CreditSentinel::new(SentinelConfig::default());
    sentinel.track_agent_start("holder");

    assert!(sentinel.acquire_lock("holder", "src/main.rs"));
    assert!(sentinel.acquire_lock("holder", "src/main.rs"));

    let snapshot = sentinel.get_metrics();
    assert_eq!(snapshot.locks.len(), 1);
    assert_eq!(snapshot.locks["src/main.rs"].holder, "holder");
}

#[test]
fn contended_lock_is_denied_without_deadlock() {
    let sentinel = CreditSentinel::new(SentinelConfig::default());
    sentinel.track_agent_start("first");
    sentinel.track_agent_start("second");

    assert!(sentinel.acquire_lock("first", "shared.txt"));
    assert!(!sentinel.acquire_lock("second", "shared.txt"));
    // Neither agent was aborted; the holder keeps its lock.
    assert_eq!(sentinel.agent_status("first"), Some(AgentStatus::Active));
    assert_eq!(sentinel.agent_status("second"), Some(AgentStatus::Active));

    sentinel.release_lock("first", "shared.txt");
    assert!(sentinel.acquire_lock("second", "shared.txt"));
}

#[test]
fn release_by_non_holder_is_a_noop() {
    let sentinel = CreditSentinel::new(SentinelConfig::default());
    assert!(sentinel.acquire_lock("owner", "file.rs"));
    sentinel.release_lock("intruder", "file.rs");
    assert_eq!(sentinel.get_metrics().locks["file.rs"].holder, "owner");
}

#[test]
fn deadlock_aborts_youngest_holder_and_releases_its_locks() {
    let sentinel = CreditSentinel::new(SentinelConfig::default());
    sentinel.track_agent_start("agent-a");
    sentinel.track_agent_start("agent-b");

    assert!(sentinel.acquire_lock("agent-a", "path-x"));
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(sentinel.acquire_lock("agent-b", "path-y"));

    // A waits on Y, then B's request for X would close the cycle.
    assert!(!sentinel.acquire_lock("agent-a", "path-y"));
    assert!(!sentinel.acquire_lock("agent-b", "path-x"));

    // B acquired its own lock later, so B is the youngest holder.
    assert_eq!(sentinel.agent_status("agent-b"), Some(AgentStatus::Aborted));
    assert_eq!(sentinel.agent_status("agent-a"), Some(AgentStatus::Active));

    let snapshot = sentinel.get_metrics();
    assert!(snapshot.locks.contains_key("path-x"));
    assert!(
        !snapshot.locks.contains_key("path-y"),
        "victim's locks must be released atomically"
    );
}

#[test]
fn deny_requester_policy_aborts_nobody() {
    let mut config = SentinelConfig::default();
    config.lock_resolution_policy = evoloop::config::LockResolutionPolicy::DenyRequester;
    let sentinel = CreditSentinel::new(config);

    assert!(sentinel.acquire_lock("agent-a", "path-x"));
    assert!(sentinel.acquire_lock("agent-b", "path-y"));
    assert!(!sentinel.acquire_lock("agent-a", "path-y"));
    assert!(!sentinel.acquire_lock("agent-b", "path-x"));

    assert_eq!(sentinel.agent_status("agent-a"), Some(AgentStatus::Active));
    assert_eq!(sentinel.agent_status("agent-b"), Some(AgentStatus::Active));
    assert_eq!(sentinel.get_metrics().locks.len(), 2);
}

#[tokio::test]
async fn wall_time_monitor_aborts_overdue_agent() {
    let mut config = SentinelConfig::default();
    config.wall_time_limits.insert("slowpoke".to_string(), 50);
    let sentinel = Arc::new(CreditSentinel::new(config));

    sentinel.track_agent_start("slowpoke");
    sentinel.acquire_lock("slowpoke", "held.rs");
    sentinel.start_monitoring().await;

    // The monitor ticks once per second; by 1.5 s the agent is well past
    // its 50 ms limit.
    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;

    assert_eq!(
        sentinel.agent_status("slowpoke"),
        Some(AgentStatus::Aborted)
    );
    assert!(
        sentinel.get_metrics().locks.is_empty(),
        "wall-time abort must release locks"
    );
    sentinel.stop_monitoring().await;
}

#[tokio::test]
async fn monitor_stops_cleanly() {
    let sentinel = Arc::new(CreditSentinel::new(SentinelConfig::default()));
    sentinel.start_monitoring().await;
    sentinel.stop_monitoring().await;
    // A second stop with no running monitor is a no-op.
    sentinel.stop_monitoring().await;
}

#[test]
fn metrics_snapshot_reflects_config_and_totals() {
    let sentinel = CreditSentinel::new(config_with_caps(500, 25, &[]));
    sentinel.track_tool_call("one", "grep", 5, 100);
    sentinel.track_tool_call("two", "edit", 7, 200);

    let snapshot = sentinel.get_metrics();
    assert_eq!(snapshot.config.global_hard_cap, 500);
    assert_eq!(snapshot.config.checkpoint_interval, 25);
    assert_eq!(snapshot.global.total_credits, 12);
    assert_eq!(snapshot.global.total_tokens, 300);
    assert_eq!(snapshot.global.total_tool_calls, 2);
    assert_eq!(snapshot.agents.len(), 2);

    let json = sentinel.export_metrics_json(None).unwrap();
    assert!(json.contains("\"total_credits\": 12"));
}
