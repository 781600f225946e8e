//! Shared builders for the integration suite.

use std::sync::Once;

use conductor::engine::prelude::*;

/// Opt-in log output for debugging test runs, driven by `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// JSON for a single plan item as the planner's structured output carries it.
pub fn single_item(step: &str) -> serde_json::Value {
    serde_json::json!({"type": "single", "data": {"step": step, "context": format!("context for {step}")}})
}

/// JSON for a parallel plan item over the given step names.
pub fn parallel_item(steps: &[&str]) -> serde_json::Value {
    let steps: Vec<serde_json::Value> = steps
        .iter()
        .map(|step| serde_json::json!({"step": step, "context": format!("context for {step}")}))
        .collect();
    serde_json::json!({"type": "parallel", "data": steps})
}

/// Planner/replanner structured reply containing a plan.
pub fn plan_reply(items: &[serde_json::Value]) -> serde_json::Value {
    serde_json::json!({"items": items})
}

/// Replanner structured reply that keeps executing the given items.
pub fn replan_reply(items: &[serde_json::Value]) -> serde_json::Value {
    serde_json::json!({"plan": items})
}

/// Replanner structured reply that answers the user.
pub fn respond_reply(answer: &str) -> serde_json::Value {
    serde_json::json!({"response": answer})
}

/// Assistant contents in order, for readable assertions.
pub fn assistant_contents(state: &ExecutionState) -> Vec<String> {
    state
        .messages()
        .iter()
        .filter(|message| message.role == MessageRole::Assistant)
        .map(|message| message.content.clone())
        .collect()
}
