//! Property-based invariants over the sentinel, the envelope quality
//! spectrum, and the summary hash.

use evoloop::config::SentinelConfig;
use evoloop::envelope::{EventEnvelope, EventMeta, EventType};
use evoloop::sentinel::CreditSentinel;
use evoloop::summary::SessionSummarizer;
use proptest::prelude::*;
use serde_json::json;

const AGENTS: [&str; 4] = ["planner", "codegen", "tester", "treasurer"];
const PATHS: [&str; 3] = ["src/lib.rs", "docs/spec.md", "Cargo.toml"];

proptest! {
    /// Global credits always equal the sum over every agent ever observed,
    /// whatever interleaving of admissions (including post-abort calls).
    #[test]
    fn global_credits_equal_agent_sum(
        calls in proptest::collection::vec((0usize..4, 0u64..40), 1..60)
    ) {
        let sentinel = CreditSentinel::new(SentinelConfig::default());
        for (agent_index, credits) in calls {
            sentinel.track_tool_call(AGENTS[agent_index], "tool", credits, credits * 10);
        }
        let snapshot = sentinel.get_metrics();
        let agent_sum: u64 = snapshot.agents.values().map(|m| m.credits_used).sum();
        prop_assert_eq!(snapshot.global.total_credits, agent_sum);
    }

    /// No two agents ever simultaneously own the same path, and a granted
    /// acquisition always records the requester as the holder.
    #[test]
    fn lock_ownership_is_exclusive(
        ops in proptest::collection::vec(
            (0usize..4, 0usize..3, proptest::bool::ANY),
            1..80
        )
    ) {
        let sentinel = CreditSentinel::new(SentinelConfig::default());
        for (agent_index, path_index, acquire) in ops {
            let agent = AGENTS[agent_index];
            let path = PATHS[path_index];
            if acquire {
                let granted = sentinel.acquire_lock(agent, path);
                let snapshot = sentinel.get_metrics();
                if granted {
                    prop_assert_eq!(snapshot.locks[path].holder.as_str(), agent);
                }
            } else {
                sentinel.release_lock(agent, path);
            }
            // One entry per path is structural; additionally check that no
            // holder is an aborted agent.
            let snapshot = sentinel.get_metrics();
            for entry in snapshot.locks.values() {
                let status = sentinel.agent_status(&entry.holder);
                prop_assert_ne!(status, Some(evoloop::sentinel::AgentStatus::Aborted));
            }
        }
    }

    /// An aborted agent never receives another allow verdict.
    #[test]
    fn no_allow_after_abort(
        calls in proptest::collection::vec(1u64..30, 1..40)
    ) {
        let mut config = SentinelConfig::default();
        config.agent_caps.insert("victim".to_string(), 50);
        let sentinel = CreditSentinel::new(config);

        let mut aborted = false;
        for credits in calls {
            let verdict = sentinel.track_tool_call("victim", "tool", credits, 0);
            if aborted {
                prop_assert_eq!(verdict, evoloop::sentinel::Verdict::Abort);
            }
            if verdict == evoloop::sentinel::Verdict::Abort {
                aborted = true;
            }
        }
    }

    /// Embedding eligibility is exactly the -0.5 threshold.
    #[test]
    fn quality_threshold_is_exact(quality in -1.0f32..=1.0f32) {
        let event = EventEnvelope::new(
            EventType::Completion,
            "agent",
            json!({}),
            EventMeta::new("evoloop-2026-08-01-001"),
        )
        .with_quality(quality);
        prop_assert_eq!(event.is_embeddable(), quality >= -0.5);
        prop_assert_eq!(event.legacy_ignore_flag(), quality < -0.5);
    }

    /// Legacy boolean → quality → boolean round-trips under the -0.5
    /// threshold.
    #[test]
    fn legacy_flag_migration_round_trips(ignore in proptest::bool::ANY) {
        let raw = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "type": "tool_call",
            "timestamp": "2026-08-01T00:00:00Z",
            "agent": "agent",
            "payload": {},
            "meta": {"session_id": "evoloop-2026-08-01-001"},
            "garbage": ignore
        });
        let event: EventEnvelope = serde_json::from_value(raw).unwrap();
        let expected = if ignore { -0.8f32 } else { 0.5f32 };
        prop_assert!((event.quality - expected).abs() < 1e-6);
        prop_assert_eq!(event.legacy_ignore_flag(), ignore);
    }

    /// Summary hashing is deterministic and extension-independent for
    /// arbitrary credit loads.
    #[test]
    fn summary_hash_deterministic(used in 0u64..900, extension_key in "[a-z]{1,8}") {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SentinelConfig::default();
        config.default_agent_cap = 10_000;
        let sentinel = CreditSentinel::new(config);
        if used > 0 {
            sentinel.track_tool_call("worker", "tool", used, 0);
        }

        let summarizer = SessionSummarizer::new(dir.path().join("s.yaml"))
            .with_repo_dir(dir.path());
        let mut summary = summarizer.generate_summary(&sentinel);

        prop_assert_eq!(summary.recompute_hash(), summary.context_hash.clone());
        prop_assert_eq!(
            summary.credits.used + summary.credits.remaining,
            1000u64.max(summary.credits.used)
        );

        summary.extensions = json!({ extension_key: used });
        prop_assert_eq!(summary.recompute_hash(), summary.context_hash.clone());
    }
}
