//! The agent graph: node handlers and wiring.
//!
//! The graph has three execution modes selected at the pass node. Simple mode
//! answers directly, agent mode loops over tool calls, planner mode runs the
//! plan/execute/replan cycle until the replanner responds to the user.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::engine::config::RunConfig;
use crate::engine::constants::{END, MAX_TOOL_ROUNDS, START};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::event::{EventSink, NoopEventSink, StreamEvent};
use crate::engine::executor::CompiledGraph;
use crate::engine::graph::StateGraph;
use crate::engine::message::{last_message_of_role, Message, MessageRole};
use crate::engine::model::{generate_structured, ChatModel, ChatRequest, StructuredSchema};
use crate::engine::plan::{CompletedItem, CompletedStep, Plan, PlanItem, PlanStep};
use crate::engine::retrieval::RetrievalPipeline;
use crate::engine::state::ExecutionState;
use crate::engine::tool::{ToolCall, ToolRegistry};

/// Node names, as they appear in checkpoint metadata.
pub const RETRIEVE: &str = "retrieve";
pub const PASS: &str = "pass";
pub const SIMPLE: &str = "simple";
pub const BASE_AGENT: &str = "base_agent";
pub const PLANNER: &str = "planner";
pub const PLAN_STEP_EXECUTOR: &str = "plan_step_executor";
pub const REPLANNER: &str = "replanner";

/// Conversation window handed to the replanner.
const REPLAN_MESSAGE_WINDOW: usize = 20;
/// Past-step window handed to the replanner.
const REPLAN_PAST_STEP_WINDOW: usize = 10;

/// Everything a node needs besides the execution state.
pub struct RunContext {
    pub model: Arc<dyn ChatModel>,
    pub tools: ToolRegistry,
    pub retrieval: Option<RetrievalPipeline>,
    pub sink: Arc<dyn EventSink>,
    pub config: RunConfig,
}

impl RunContext {
    pub fn new(model: Arc<dyn ChatModel>, config: RunConfig) -> Self {
        Self {
            model,
            tools: ToolRegistry::new(),
            retrieval: None,
            sink: Arc::new(NoopEventSink),
            config,
        }
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalPipeline) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

fn user_question(state: &ExecutionState) -> String {
    last_message_of_role(state.messages(), MessageRole::User)
        .map(|message| message.content.clone())
        .unwrap_or_default()
}

/// System message carrying retrieved documents, when any were kept.
fn document_context(state: &ExecutionState) -> Option<Message> {
    if state.documents().is_empty() {
        return None;
    }
    let joined = state
        .documents()
        .iter()
        .map(|document| document.page_content.as_str())
        .collect::<Vec<_>>()
        .join("\n---\n");
    Some(Message::system(format!(
        "Relevant retrieved context:\n{}",
        joined
    )))
}

fn conversation_request(state: &ExecutionState) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(context) = document_context(state) {
        messages.push(context);
    }
    messages.extend(state.messages().iter().cloned());
    ChatRequest::new(messages)
}

// --- retrieve ------------------------------------------------------------

async fn retrieve_node(
    mut state: ExecutionState,
    ctx: &RunContext,
) -> EngineResult<ExecutionState> {
    let Some(pipeline) = &ctx.retrieval else {
        return Ok(state);
    };
    let question = user_question(&state);
    let documents = pipeline.retrieve(&question).await;
    tracing::info!(kept = documents.len(), "retrieval complete");
    state.set_documents(documents);
    Ok(state)
}

// --- pass ----------------------------------------------------------------

/// Mode selection happens on the edge out of this node; the node itself
/// leaves the state untouched so the decision gets its own superstep.
async fn pass_node(state: ExecutionState, _ctx: &RunContext) -> EngineResult<ExecutionState> {
    Ok(state)
}

// --- simple --------------------------------------------------------------

async fn simple_node(mut state: ExecutionState, ctx: &RunContext) -> EngineResult<ExecutionState> {
    let response = ctx.model.generate(conversation_request(&state)).await?;
    ctx.sink.emit(StreamEvent::ai(&response.message.content))?;
    state.append_message(response.message);
    Ok(state)
}

// --- base agent ----------------------------------------------------------

/// Tool calls requested by an assistant message, read from its metadata.
fn requested_tool_calls(message: &Message) -> Vec<ToolCall> {
    message
        .metadata
        .get("tool_calls")
        .and_then(|calls| serde_json::from_value(calls.clone()).ok())
        .unwrap_or_default()
}

async fn base_agent_node(
    mut state: ExecutionState,
    ctx: &RunContext,
) -> EngineResult<ExecutionState> {
    let definitions = ctx.tools.definitions();

    for _ in 0..MAX_TOOL_ROUNDS {
        let request = conversation_request(&state).with_tools(definitions.clone());
        let response = ctx.model.generate(request).await?;
        let calls = requested_tool_calls(&response.message);

        if calls.is_empty() {
            ctx.sink.emit(StreamEvent::ai(&response.message.content))?;
            state.append_message(response.message);
            return Ok(state);
        }

        state.append_message(response.message);
        for call in calls {
            let output = ctx.tools.execute(&call, ctx.sink.as_ref()).await?;
            state.append_message(
                Message::tool(output.to_string())
                    .with_metadata("tool_call_id", serde_json::json!(call.id)),
            );
        }
    }

    Err(EngineError::execution(
        BASE_AGENT,
        format!("no final answer within {} tool rounds", MAX_TOOL_ROUNDS),
    ))
}

// --- planner -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PlannerOutput {
    items: Vec<PlanItem>,
}

fn plan_schema(name: &str) -> StructuredSchema {
    StructuredSchema::new(
        name,
        serde_json::json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "maxItems": crate::engine::plan::MAX_PLAN_ITEMS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": {"enum": ["single", "parallel"]},
                            "data": {}
                        },
                        "required": ["type", "data"]
                    }
                }
            },
            "required": ["items"]
        }),
    )
}

async fn planner_node(mut state: ExecutionState, ctx: &RunContext) -> EngineResult<ExecutionState> {
    let mut request = conversation_request(&state);
    request.messages.insert(
        0,
        Message::system(
            "Break the user's request into an ordered plan of at most 9 items. \
             Group 2 to 5 independent steps into a parallel item; keep dependent \
             steps single and in order.",
        ),
    );

    let output: PlannerOutput =
        generate_structured(ctx.model.as_ref(), request, plan_schema("plan")).await?;
    if output.items.is_empty() {
        tracing::warn!("planner produced no items, ending run");
        state.set_plan(Vec::new());
        return Ok(state);
    }
    let plan = Plan::new(output.items)?;
    tracing::info!(items = plan.len(), "plan created");
    state.set_plan(plan.items().to_vec());
    Ok(state)
}

// --- plan step executor --------------------------------------------------

/// Runs one step as a focused sub-agent call.
async fn run_step(
    ctx: &RunContext,
    step: &PlanStep,
    state: &ExecutionState,
) -> EngineResult<Message> {
    let mut messages = vec![Message::system(
        "Execute exactly the step you are given, using its context. \
         Report the outcome; do not plan further work.",
    )];
    if let Some(context) = document_context(state) {
        messages.push(context);
    }
    if !state.past_steps().is_empty() {
        let summary = state
            .past_steps()
            .iter()
            .flat_map(|item| item.steps())
            .map(|done| format!("{}: {}", done.step.step, done.message.content))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(Message::system(format!("Completed so far:\n{}", summary)));
    }
    messages.push(Message::user(format!(
        "Step: {}\nContext: {}",
        step.step, step.context
    )));

    let response = ctx
        .model
        .generate(ChatRequest::new(messages).with_tools(ctx.tools.definitions()))
        .await?;
    ctx.sink.emit(StreamEvent::ai(&response.message.content))?;
    Ok(response.message)
}

async fn plan_step_executor_node(
    mut state: ExecutionState,
    ctx: &RunContext,
) -> EngineResult<ExecutionState> {
    let mut remaining = state.plan().to_vec();
    if remaining.is_empty() {
        return Err(EngineError::execution(
            PLAN_STEP_EXECUTOR,
            "routed with an empty plan",
        ));
    }
    let head = remaining.remove(0);

    let completed = match head {
        PlanItem::Single(step) => {
            let message = run_step(ctx, &step, &state).await?;
            CompletedItem::Single(CompletedStep::new(step, message))
        }
        PlanItem::Parallel(steps) => {
            // Fan out; join_all keeps results in the group's step order no
            // matter which finishes first.
            let futures: Vec<_> = steps
                .iter()
                .map(|step| run_step(ctx, step, &state))
                .collect();
            let results = futures_util::future::join_all(futures).await;
            let mut group = Vec::with_capacity(steps.len());
            for (step, result) in steps.into_iter().zip(results) {
                let message = match result {
                    Ok(message) => message,
                    Err(err) if err.is_cancellation() => return Err(err),
                    // A failed step must not sink its siblings' results; it
                    // completes as an error note for the replanner to weigh.
                    Err(err) => {
                        tracing::warn!(step = %step.step, error = %err, "parallel step failed");
                        Message::assistant(format!("Step failed: {}", err))
                    }
                };
                group.push(CompletedStep::new(step, message));
            }
            CompletedItem::Group(group)
        }
    };

    state.push_past_step(completed);
    state.set_plan(remaining);
    Ok(state)
}

// --- replanner -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ReplanDecision {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    plan: Option<Vec<PlanItem>>,
}

/// Conversation window for replanning: tool exchanges dropped, then the most
/// recent messages kept.
pub(crate) fn replan_message_window(messages: &[Message]) -> Vec<Message> {
    let filtered: Vec<Message> = messages
        .iter()
        .filter(|message| !message.is_tool_exchange())
        .cloned()
        .collect();
    let start = filtered.len().saturating_sub(REPLAN_MESSAGE_WINDOW);
    filtered[start..].to_vec()
}

fn replan_schema() -> StructuredSchema {
    StructuredSchema::new(
        "replan",
        serde_json::json!({
            "type": "object",
            "properties": {
                "response": {"type": "string"},
                "plan": {"type": "array"}
            }
        }),
    )
}

async fn replanner_node(
    mut state: ExecutionState,
    ctx: &RunContext,
) -> EngineResult<ExecutionState> {
    let mut messages = vec![Message::system(
        "Decide whether the completed steps answer the user. If they do, set \
         `response` to the final answer. Otherwise set `plan` to the remaining \
         work only, never repeating a completed step.",
    )];
    messages.extend(replan_message_window(state.messages()));

    let window_start = state
        .past_steps()
        .len()
        .saturating_sub(REPLAN_PAST_STEP_WINDOW);
    let past_window = &state.past_steps()[window_start..];
    if !past_window.is_empty() {
        let summary = past_window
            .iter()
            .flat_map(|item| item.steps())
            .map(|done| format!("{}: {}", done.step.step, done.message.content))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(Message::system(format!("Completed steps:\n{}", summary)));
    }
    if !state.plan().is_empty() {
        messages.push(Message::system(format!(
            "Remaining plan:\n{}",
            serde_json::to_string(state.plan())?
        )));
    }

    let decision: ReplanDecision = generate_structured(
        ctx.model.as_ref(),
        ChatRequest::new(messages),
        replan_schema(),
    )
    .await?;

    if let Some(response) = decision.response {
        // Respond to the user: the step trail and retrieved documents travel
        // on the final message, then the working channels reset for the next
        // run.
        let trail = serde_json::to_value(state.past_steps())?;
        let documents = serde_json::to_value(state.documents())?;
        ctx.sink.emit(StreamEvent::ai(&response))?;
        state.append_message(
            Message::assistant(response)
                .with_metadata("past_steps", trail)
                .with_metadata("documents", documents),
        );
        state.set_plan(Vec::new());
        state.set_past_steps(Vec::new());
        state.set_documents(Vec::new());
        return Ok(state);
    }

    match decision.plan {
        Some(items) if !items.is_empty() => {
            let plan = Plan::new(items)?;
            tracing::info!(items = plan.len(), "replanned");
            state.set_plan(plan.items().to_vec());
        }
        _ => {
            tracing::warn!("replanner produced neither response nor plan, ending run");
            state.set_plan(Vec::new());
        }
    }
    Ok(state)
}

// --- routing -------------------------------------------------------------

fn entry_route(_state: &ExecutionState, ctx: &RunContext) -> String {
    if ctx.config.wants_retrieval() && ctx.retrieval.is_some() {
        RETRIEVE.to_string()
    } else {
        PASS.to_string()
    }
}

fn mode_route(_state: &ExecutionState, ctx: &RunContext) -> String {
    if ctx.config.planner_mode {
        PLANNER.to_string()
    } else if !ctx.tools.is_empty() && ctx.model.supports_tools() {
        BASE_AGENT.to_string()
    } else {
        SIMPLE.to_string()
    }
}

/// Empty plan ends the run; anything else executes the next item.
fn plan_route(state: &ExecutionState, _ctx: &RunContext) -> String {
    if state.plan().is_empty() {
        END.to_string()
    } else {
        PLAN_STEP_EXECUTOR.to_string()
    }
}

/// Builds and compiles the agent graph.
pub fn agent_graph() -> EngineResult<CompiledGraph<RunContext>> {
    let mut entry_targets = HashMap::new();
    entry_targets.insert(RETRIEVE.to_string(), RETRIEVE.to_string());
    entry_targets.insert(PASS.to_string(), PASS.to_string());

    let mut mode_targets = HashMap::new();
    mode_targets.insert(SIMPLE.to_string(), SIMPLE.to_string());
    mode_targets.insert(BASE_AGENT.to_string(), BASE_AGENT.to_string());
    mode_targets.insert(PLANNER.to_string(), PLANNER.to_string());

    let mut plan_targets = HashMap::new();
    plan_targets.insert(END.to_string(), END.to_string());
    plan_targets.insert(PLAN_STEP_EXECUTOR.to_string(), PLAN_STEP_EXECUTOR.to_string());

    StateGraph::new()
        .add_node(RETRIEVE, |state, ctx| Box::pin(retrieve_node(state, ctx)))
        .add_node(PASS, |state, ctx| Box::pin(pass_node(state, ctx)))
        .add_node(SIMPLE, |state, ctx| Box::pin(simple_node(state, ctx)))
        .add_node(BASE_AGENT, |state, ctx| {
            Box::pin(base_agent_node(state, ctx))
        })
        .add_node(PLANNER, |state, ctx| Box::pin(planner_node(state, ctx)))
        .add_node(PLAN_STEP_EXECUTOR, |state, ctx| {
            Box::pin(plan_step_executor_node(state, ctx))
        })
        .add_node(REPLANNER, |state, ctx| {
            Box::pin(replanner_node(state, ctx))
        })
        .add_conditional_edges(START, entry_route, entry_targets)
        .add_edge(RETRIEVE, PASS)
        .add_conditional_edges(PASS, mode_route, mode_targets)
        .add_edge(SIMPLE, END)
        .add_edge(BASE_AGENT, END)
        .add_conditional_edges(PLANNER, plan_route, plan_targets.clone())
        .add_edge(PLAN_STEP_EXECUTOR, REPLANNER)
        .add_conditional_edges(REPLANNER, plan_route, plan_targets)
        .compile()
}
