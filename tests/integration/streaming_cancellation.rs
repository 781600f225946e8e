//! Runner lifecycle: batched streaming, status transitions, cancellation.

use std::sync::Arc;
use std::time::Duration;

use conductor::engine::model::MockChatModel;
use conductor::engine::prelude::*;

use crate::helpers::{plan_reply, replan_reply, respond_reply, single_item};

fn parts() -> (Arc<MemoryRunStatusStore>, Arc<MemoryChunkLog>) {
    (
        Arc::new(MemoryRunStatusStore::new()),
        Arc::new(MemoryChunkLog::new()),
    )
}

#[tokio::test(start_paused = true)]
async fn chunks_flush_in_batches_while_the_run_is_live() {
    let (status, log) = parts();
    let runner = Runner::new(agent_graph().unwrap(), status.clone(), log.clone());

    let model = MockChatModel::new("mock");
    let config = RunConfig::new("t1").with_planner_mode(true);
    model.push_structured(plan_reply(&[single_item("one"), single_item("two")]));
    model.push_text("one done");
    model.push_structured(replan_reply(&[single_item("two")]));
    model.push_text_after("two done", Duration::from_secs(2));
    model.push_structured(respond_reply("final"));

    let ctx = RunContext::new(Arc::new(model), config);
    let probe_log = log.clone();

    let (outcome, mid_run_chunks) = tokio::join!(
        runner.execute("run-1", vec![Message::user("go")], ctx),
        async move {
            // Well past the first flush interval but before step two ends.
            tokio::time::sleep(Duration::from_secs(1)).await;
            probe_log.chunks_since("run-1", 0).unwrap().len()
        }
    );
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, RunStatus::Done);
    assert_eq!(outcome.flushed_events, 3);
    // The first step's chunk was visible before the run finished.
    assert!(mid_run_chunks >= 1);
    assert!(mid_run_chunks < 3);
    assert_eq!(log.chunks_since("run-1", 0).unwrap().len(), 3);
    assert_eq!(
        status.get("run-1").unwrap().unwrap().status,
        RunStatus::Done
    );
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_the_in_flight_step_but_flushes_earlier_chunks() {
    let (status, log) = parts();
    let runner = Runner::new(agent_graph().unwrap(), status.clone(), log.clone());

    let model = MockChatModel::new("mock");
    let config = RunConfig::new("t1").with_planner_mode(true);
    model.push_structured(plan_reply(&[single_item("one"), single_item("two")]));
    model.push_text("one done");
    model.push_structured(replan_reply(&[single_item("two")]));
    // Slow enough that the cancellation poll fires mid-step.
    model.push_text_after("two done", Duration::from_secs(30));

    let status_writer = status.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        status_writer
            .set("run-1", StatusRecord::new(RunStatus::Cancelled))
            .unwrap();
    });

    let started = tokio::time::Instant::now();
    let ctx = RunContext::new(Arc::new(model), config);
    let outcome = runner
        .execute("run-1", vec![Message::user("go")], ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.state.is_none());
    assert_eq!(
        status.get("run-1").unwrap().unwrap().status,
        RunStatus::Cancelled
    );
    // The 30 s step was dropped mid-call, not awaited out.
    assert!(started.elapsed() < Duration::from_secs(30));

    // Everything emitted before the abort reached the log; the aborted
    // call's output never did.
    let chunks = log.chunks_since("run-1", 0).unwrap();
    let contents: Vec<&StreamEvent> = chunks.iter().map(|(_, event)| event).collect();
    assert!(contents.contains(&&StreamEvent::ai("one done")));
    assert!(!contents.contains(&&StreamEvent::ai("two done")));
}

#[tokio::test]
async fn status_moves_from_pending_through_streaming_to_done() {
    let (status, log) = parts();
    let runner = Runner::new(agent_graph().unwrap(), status.clone(), log);

    status
        .set("run-1", StatusRecord::new(RunStatus::Pending))
        .unwrap();
    assert!(!status.get("run-1").unwrap().unwrap().status.is_terminal());

    let model = MockChatModel::new("mock");
    model.push_text("answer");
    let ctx = RunContext::new(Arc::new(model), RunConfig::new("t1"));
    runner
        .execute("run-1", vec![Message::user("q")], ctx)
        .await
        .unwrap();

    let record = status.get("run-1").unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Done);
    assert!(record.status.is_terminal());
}
