//! Mode selection and per-mode behavior: simple, tool agent, retrieval.

use std::sync::Arc;
use std::time::Duration;

use conductor::engine::event::CollectingEventSink;
use conductor::engine::graph::BoxFuture;
use conductor::engine::model::MockChatModel;
use conductor::engine::prelude::*;

use crate::helpers::assistant_contents;

struct EchoTool;

impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "echo",
            "echoes its arguments",
            serde_json::json!({"type": "object"}),
        )
    }

    fn call(&self, arguments: serde_json::Value) -> BoxFuture<'_, EngineResult<serde_json::Value>> {
        Box::pin(async move { Ok(arguments) })
    }
}

struct StaticSearcher;

impl WebSearcher for StaticSearcher {
    fn search(&self, _query: &str) -> BoxFuture<'_, EngineResult<Vec<RetrievedDocument>>> {
        Box::pin(async {
            Ok(vec![RetrievedDocument::new(
                "rust is a systems language",
                serde_json::json!({"source": "web"}),
            )])
        })
    }
}

#[tokio::test]
async fn simple_mode_answers_directly() {
    let model = MockChatModel::new("mock");
    model.push_text("direct answer");

    let sink = Arc::new(CollectingEventSink::new());
    let ctx = RunContext::new(Arc::new(model), RunConfig::new("t1")).with_sink(sink.clone());
    let exec = ExecutionConfig::new(RunConfig::new("t1"));

    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("hello")], &ctx, &exec)
        .await
        .unwrap();

    assert_eq!(assistant_contents(&state), vec!["direct answer".to_string()]);
    assert_eq!(sink.events(), vec![StreamEvent::ai("direct answer")]);
}

#[tokio::test]
async fn base_agent_runs_requested_tools_then_answers() {
    let model = MockChatModel::new("mock");
    model.push_message(Message::assistant("").with_metadata(
        "tool_calls",
        serde_json::json!([
            {"id": "call-1", "name": "echo", "arguments": {"payload": 42}}
        ]),
    ));
    model.push_text("used the tool");

    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool));

    let sink = Arc::new(CollectingEventSink::new());
    let ctx = RunContext::new(Arc::new(model), RunConfig::new("t1"))
        .with_tools(tools)
        .with_sink(sink.clone());
    let exec = ExecutionConfig::new(RunConfig::new("t1"));

    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("use echo")], &ctx, &exec)
        .await
        .unwrap();

    let roles: Vec<MessageRole> = state.messages().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::Tool,
            MessageRole::Assistant,
        ]
    );
    assert_eq!(state.messages().last().unwrap().content, "used the tool");
    assert_eq!(
        state.messages()[2].metadata["tool_call_id"],
        serde_json::json!("call-1")
    );

    let events = sink.events();
    assert_eq!(events.len(), 3);
    assert_eq!(
        events[0],
        StreamEvent::tool_start("echo", serde_json::json!({"payload": 42}))
    );
    assert_eq!(
        events[1],
        StreamEvent::tool_end("echo", serde_json::json!({"payload": 42}))
    );
    assert_eq!(events[2], StreamEvent::ai("used the tool"));
}

#[tokio::test]
async fn retrieval_feeds_relevant_documents_into_the_answer() {
    let model: Arc<MockChatModel> = Arc::new(MockChatModel::new("mock"));
    model.push_structured(serde_json::json!({"queries": ["rust language"]}));
    model.push_structured(serde_json::json!({"relevant": true}));
    model.push_text("grounded answer");

    let config = RunConfig::new("t1").with_web_search(true);
    let pipeline = RetrievalPipeline::new(model.clone(), Duration::from_secs(5))
        .with_web_searcher(Arc::new(StaticSearcher));

    let ctx = RunContext::new(model, config.clone()).with_retrieval(pipeline);
    let exec = ExecutionConfig::new(config);

    let state = agent_graph()
        .unwrap()
        .run(vec![Message::user("what is rust?")], &ctx, &exec)
        .await
        .unwrap();

    assert_eq!(state.documents().len(), 1);
    assert_eq!(
        state.documents()[0].page_content,
        "rust is a systems language"
    );
    assert_eq!(
        assistant_contents(&state),
        vec!["grounded answer".to_string()]
    );
}
