//! Durability: runs resume from SQLite checkpoints across process restarts.

use std::sync::Arc;

use conductor::checkpoint::{CheckpointConfig, Checkpointer, SqliteCheckpointer};
use conductor::engine::model::MockChatModel;
use conductor::engine::prelude::*;

use crate::helpers::assistant_contents;

#[tokio::test]
async fn conversation_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let config = RunConfig::new("thread-1");

    {
        let store = Arc::new(SqliteCheckpointer::open(&path).unwrap());
        let model = MockChatModel::new("mock");
        model.push_text("first answer");

        let ctx = RunContext::new(Arc::new(model), config.clone());
        let exec = ExecutionConfig::new(config.clone()).with_checkpointer(store);
        agent_graph()
            .unwrap()
            .run(vec![Message::user("first question")], &ctx, &exec)
            .await
            .unwrap();
    }

    // New store handle over the same file, as after a restart.
    let store = Arc::new(SqliteCheckpointer::open(&path).unwrap());
    let model = MockChatModel::new("mock");
    model.push_text("second answer");

    let ctx = RunContext::new(Arc::new(model), config.clone());
    let exec = ExecutionConfig::new(config.clone()).with_checkpointer(store.clone());
    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("second question")], &ctx, &exec)
        .await
        .unwrap();

    let contents: Vec<&str> = state
        .messages()
        .iter()
        .map(|message| message.content.as_str())
        .collect();
    assert_eq!(
        contents,
        vec![
            "first question",
            "first answer",
            "second question",
            "second answer",
        ]
    );
    assert_eq!(
        assistant_contents(&state),
        vec!["first answer".to_string(), "second answer".to_string()]
    );
}

#[tokio::test]
async fn history_lists_newest_first_with_parent_chain() {
    let store = Arc::new(SqliteCheckpointer::open_in_memory().unwrap());
    let config = RunConfig::new("thread-1");

    let model = MockChatModel::new("mock");
    model.push_text("answer");
    let ctx = RunContext::new(Arc::new(model), config.clone());
    let exec = ExecutionConfig::new(config.clone()).with_checkpointer(store.clone());
    agent_graph()
        .unwrap()
        .run(vec![Message::user("question")], &ctx, &exec)
        .await
        .unwrap();

    let tuples = store
        .list(&CheckpointConfig::new("thread-1", "default"), None, None)
        .unwrap();
    // One checkpoint per superstep: pass, then simple.
    assert_eq!(tuples.len(), 2);
    assert_eq!(tuples[0].checkpoint.metadata["node"], "simple");
    assert_eq!(tuples[1].checkpoint.metadata["node"], "pass");
    assert_eq!(
        tuples[0].parent_config.as_ref().unwrap().checkpoint_id,
        Some(tuples[1].checkpoint.id.clone())
    );
    assert!(tuples[1].parent_config.is_none());
}

#[tokio::test]
async fn namespaces_do_not_observe_each_other() {
    let store = Arc::new(SqliteCheckpointer::open_in_memory().unwrap());

    let config = RunConfig::new("thread-1").with_namespace("tenant-a");
    let model = MockChatModel::new("mock");
    model.push_text("answer for a");
    let ctx = RunContext::new(Arc::new(model), config.clone());
    let exec = ExecutionConfig::new(config).with_checkpointer(store.clone());
    agent_graph()
        .unwrap()
        .run(vec![Message::user("question")], &ctx, &exec)
        .await
        .unwrap();

    assert!(store
        .get_tuple(&CheckpointConfig::new("thread-1", "tenant-a"))
        .unwrap()
        .is_some());
    assert!(store
        .get_tuple(&CheckpointConfig::new("thread-1", "tenant-b"))
        .unwrap()
        .is_none());

    // A run in the other namespace starts from an empty state.
    let config = RunConfig::new("thread-1").with_namespace("tenant-b");
    let model = MockChatModel::new("mock");
    model.push_text("answer for b");
    let ctx = RunContext::new(Arc::new(model), config.clone());
    let exec = ExecutionConfig::new(config).with_checkpointer(store.clone());
    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("fresh question")], &ctx, &exec)
        .await
        .unwrap();
    assert_eq!(state.messages().len(), 2);
}
