//! Plan/execute/replan cycle, end to end over the compiled agent graph.

use std::sync::Arc;
use std::time::Duration;

use conductor::checkpoint::{CheckpointConfig, Checkpointer, MemoryCheckpointer};
use conductor::engine::event::CollectingEventSink;
use conductor::engine::model::MockChatModel;
use conductor::engine::prelude::*;
use conductor::engine::state::channels;

use crate::helpers::{
    assistant_contents, init_tracing, parallel_item, plan_reply, replan_reply, respond_reply,
    single_item,
};

fn planner_config() -> RunConfig {
    RunConfig::new("planner-thread").with_planner_mode(true)
}

#[tokio::test(start_paused = true)]
async fn full_cycle_produces_one_final_answer_with_step_trail() {
    init_tracing();
    let model = MockChatModel::new("mock");
    model.push_structured(plan_reply(&[
        single_item("outline"),
        parallel_item(&["research a", "research b", "research c"]),
    ]));
    model.push_text("outline done");
    model.push_structured(replan_reply(&[parallel_item(&[
        "research a",
        "research b",
        "research c",
    ])]));
    // Staggered completion: the last-listed step finishes first.
    model.push_text_after("result a", Duration::from_millis(300));
    model.push_text_after("result b", Duration::from_millis(100));
    model.push_text("result c");
    model.push_structured(respond_reply("final answer"));

    let sink = Arc::new(CollectingEventSink::new());
    let ctx = RunContext::new(Arc::new(model), planner_config()).with_sink(sink.clone());
    let exec = ExecutionConfig::new(planner_config());

    let graph = agent_graph().unwrap();
    let state = graph
        .run(vec![Message::user("do the work")], &ctx, &exec)
        .await
        .unwrap();

    // Exactly one assistant message: the final answer.
    assert_eq!(assistant_contents(&state), vec!["final answer".to_string()]);
    assert!(state.plan().is_empty());
    assert!(state.past_steps().is_empty());

    // The step trail rides on the final message's metadata.
    let last = state.messages().last().unwrap();
    let trail = &last.metadata["past_steps"];
    assert_eq!(trail.as_array().unwrap().len(), 2);
    assert_eq!(trail[0]["type"], "single");
    assert_eq!(trail[0]["data"]["message"]["content"], "outline done");

    // The parallel group preserves step order despite completion order.
    assert_eq!(trail[1]["type"], "group");
    let group = trail[1]["data"].as_array().unwrap();
    let contents: Vec<&str> = group
        .iter()
        .map(|done| done["message"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["result a", "result b", "result c"]);

    // One ai event per executed step plus the final answer.
    let events = sink.events();
    assert_eq!(events.len(), 5);
}

#[tokio::test]
async fn plan_and_past_steps_stay_consistent_across_checkpoints() {
    let model = MockChatModel::new("mock");
    model.push_structured(plan_reply(&[single_item("one"), single_item("two")]));
    model.push_text("one done");
    model.push_structured(replan_reply(&[single_item("two")]));
    model.push_text("two done");
    model.push_structured(respond_reply("all done"));

    let store = Arc::new(MemoryCheckpointer::new());
    let ctx = RunContext::new(Arc::new(model), planner_config());
    let exec = ExecutionConfig::new(planner_config()).with_checkpointer(store.clone());

    agent_graph()
        .unwrap()
        .run(vec![Message::user("go")], &ctx, &exec)
        .await
        .unwrap();

    let tuples = store
        .list(
            &CheckpointConfig::new("planner-thread", "default"),
            None,
            None,
        )
        .unwrap();

    // Oldest first for readability.
    let mut tuples = tuples;
    tuples.reverse();

    let mut executed = 0usize;
    for tuple in &tuples {
        let plan: Vec<serde_json::Value> = tuple
            .checkpoint
            .channel_values
            .get(channels::PLAN)
            .map(|value| value.decode().unwrap())
            .unwrap_or_default();
        let past: Vec<serde_json::Value> = tuple
            .checkpoint
            .channel_values
            .get(channels::PAST_STEPS)
            .map(|value| value.decode().unwrap())
            .unwrap_or_default();

        if tuple.checkpoint.metadata["node"] == "plan_step_executor" {
            executed += 1;
            // Every consumed item is accounted for in the trail.
            assert_eq!(past.len(), executed);
        }
        // Plan and trail never both grow past the original item count.
        assert!(plan.len() + past.len() <= 2);
    }
    assert_eq!(executed, 2);
}

#[tokio::test]
async fn failed_parallel_step_degrades_to_an_error_note() {
    let model = MockChatModel::new("mock");
    model.push_structured(plan_reply(&[parallel_item(&["alpha", "beta"])]));
    model.push_error("provider unavailable");
    model.push_text("result beta");
    model.push_structured(respond_reply("best effort answer"));

    let ctx = RunContext::new(Arc::new(model), planner_config());
    let exec = ExecutionConfig::new(planner_config());

    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("go")], &ctx, &exec)
        .await
        .unwrap();

    // One failing step does not end the run; its siblings' results survive.
    assert_eq!(
        assistant_contents(&state),
        vec!["best effort answer".to_string()]
    );

    let last = state.messages().last().unwrap();
    let group = last.metadata["past_steps"][0]["data"].as_array().unwrap();
    assert_eq!(group.len(), 2);
    assert!(group[0]["message"]["content"]
        .as_str()
        .unwrap()
        .contains("provider unavailable"));
    assert_eq!(group[1]["message"]["content"], "result beta");
}

#[tokio::test]
async fn oversized_plan_is_rejected() {
    let model = MockChatModel::new("mock");
    let items: Vec<serde_json::Value> = (0..10)
        .map(|i| single_item(&format!("step {i}")))
        .collect();
    model.push_structured(plan_reply(&items));

    let ctx = RunContext::new(Arc::new(model), planner_config());
    let exec = ExecutionConfig::new(planner_config());

    let err = agent_graph()
        .unwrap()
        .run(vec![Message::user("go")], &ctx, &exec)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn undersized_parallel_group_is_rejected() {
    let model = MockChatModel::new("mock");
    model.push_structured(plan_reply(&[parallel_item(&["only one"])]));

    let ctx = RunContext::new(Arc::new(model), planner_config());
    let exec = ExecutionConfig::new(planner_config());

    let err = agent_graph()
        .unwrap()
        .run(vec![Message::user("go")], &ctx, &exec)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn empty_plan_ends_the_run_without_executing_steps() {
    let model = MockChatModel::new("mock");
    model.push_structured(plan_reply(&[]));

    let sink = Arc::new(CollectingEventSink::new());
    let ctx = RunContext::new(Arc::new(model), planner_config()).with_sink(sink.clone());
    let exec = ExecutionConfig::new(planner_config());

    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("go")], &ctx, &exec)
        .await
        .unwrap();

    assert!(state.plan().is_empty());
    assert!(state.past_steps().is_empty());
    assert!(sink.events().is_empty());
}
