//! CLI entry point for the meta-analyst.
//!
//! Usage: `meta-analyst [summary_path] [metrics_path]`
//!
//! Exits 0 on success, 1 when a critical threshold tripped (credit usage
//! ≥ 95 %, aborted agents, or error-level warnings in the summary).

use evoloop::analyst::MetaAnalyst;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LOG_LEVEL", "info"))
        .init();

    let mut args = std::env::args().skip(1);
    let summary_path = args
        .next()
        .unwrap_or_else(|| "schemas/session_summary.yaml".to_string());
    let metrics_path = args
        .next()
        .unwrap_or_else(|| "schemas/metrics_v2.csv".to_string());

    let analyst = MetaAnalyst::new(summary_path, metrics_path);
    std::process::exit(analyst.run());
}
