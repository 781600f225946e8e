//! The superstep loop: node execution, routing, and per-step checkpointing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::serde::TaggedValue;
use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointTuple, Checkpointer};
use crate::engine::cancel::CancellationToken;
use crate::engine::config::RunConfig;
use crate::engine::constants::{END, START};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::graph::{ConditionalEdge, NodeFn};
use crate::engine::message::Message;
use crate::engine::state::ExecutionState;

/// Execution-time wiring around a compiled graph: where checkpoints go and
/// how the run can be cancelled. The graph itself stays reusable across runs.
#[derive(Clone)]
pub struct ExecutionConfig {
    pub run: RunConfig,
    pub checkpointer: Option<Arc<dyn Checkpointer>>,
    pub cancel: CancellationToken,
}

impl ExecutionConfig {
    pub fn new(run: RunConfig) -> Self {
        Self {
            run,
            checkpointer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig::new(&self.run.thread_id, &self.run.namespace)
    }
}

/// Rebuilds execution state from a loaded checkpoint's channel values.
pub(crate) fn state_from_tuple(tuple: &CheckpointTuple) -> EngineResult<ExecutionState> {
    let mut state = ExecutionState::new();
    for (channel, value) in &tuple.checkpoint.channel_values {
        let Some(version) = tuple.checkpoint.channel_versions.get(channel).copied() else {
            continue;
        };
        state.restore_channel(channel, value.decode()?, version)?;
    }
    Ok(state)
}

/// A validated, frozen transition table ready to execute.
pub struct CompiledGraph<C> {
    nodes: HashMap<String, NodeFn<C>>,
    edges: HashMap<String, String>,
    conditional: HashMap<String, ConditionalEdge<C>>,
}

impl<C> std::fmt::Debug for CompiledGraph<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("edges", &self.edges)
            .field("conditional", &self.conditional.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<C> CompiledGraph<C> {
    pub(crate) fn new(
        nodes: HashMap<String, NodeFn<C>>,
        edges: HashMap<String, String>,
        conditional: HashMap<String, ConditionalEdge<C>>,
    ) -> Self {
        Self {
            nodes,
            edges,
            conditional,
        }
    }

    /// Next node after `current`, via its direct or conditional edge.
    fn next_node(&self, current: &str, state: &ExecutionState, ctx: &C) -> EngineResult<String> {
        if let Some(to) = self.edges.get(current) {
            return Ok(to.clone());
        }
        if let Some(edge) = self.conditional.get(current) {
            let route = (edge.router)(state, ctx);
            return edge.targets.get(&route).cloned().ok_or_else(|| {
                EngineError::Config(format!(
                    "router at {:?} returned unmapped route {:?}",
                    current, route
                ))
            });
        }
        Err(EngineError::NodeNotFound(format!(
            "no outgoing edge from {:?}",
            current
        )))
    }

    /// Restores state from the latest checkpoint of the lineage, if any.
    /// Returns the state and the checkpoint id to chain from.
    fn restore(
        &self,
        exec: &ExecutionConfig,
    ) -> EngineResult<(ExecutionState, Option<String>)> {
        let Some(checkpointer) = &exec.checkpointer else {
            return Ok((ExecutionState::new(), None));
        };
        let Some(tuple) = checkpointer.get_tuple(&exec.checkpoint_config())? else {
            return Ok((ExecutionState::new(), None));
        };

        let state = state_from_tuple(&tuple)?;
        tracing::debug!(
            checkpoint_id = %tuple.checkpoint.id,
            thread_id = %exec.run.thread_id,
            "resumed from checkpoint"
        );
        Ok((state, Some(tuple.checkpoint.id)))
    }

    /// Writes one checkpoint covering the channels that changed since the
    /// given baseline. Returns the new checkpoint id.
    fn write_checkpoint(
        &self,
        exec: &ExecutionConfig,
        state: &ExecutionState,
        baseline: &HashMap<String, u64>,
        parent_id: Option<&str>,
        superstep: usize,
        node: &str,
    ) -> EngineResult<Option<String>> {
        let Some(checkpointer) = &exec.checkpointer else {
            return Ok(None);
        };

        let mut new_values = HashMap::new();
        let mut writes = Vec::new();
        for channel in state.changed_since(baseline) {
            let value = TaggedValue::json(state.channel_value(&channel)?);
            writes.push((channel.clone(), value.clone()));
            new_values.insert(channel, value);
        }

        // The node's writes are attributed to the checkpoint it ran against,
        // then materialized by the checkpoint that follows.
        if let Some(parent_id) = parent_id {
            if !writes.is_empty() {
                let parent_config = exec.checkpoint_config().with_checkpoint_id(parent_id);
                checkpointer.put_writes(&parent_config, writes, node)?;
            }
        }

        let mut checkpoint = Checkpoint::new(
            state.channel_versions(),
            serde_json::json!({"superstep": superstep, "node": node}),
        );
        if let Some(parent_id) = parent_id {
            checkpoint = checkpoint.with_parent(parent_id);
        }

        let stored = checkpointer.put(&exec.checkpoint_config(), checkpoint, new_values)?;
        Ok(stored.checkpoint_id)
    }

    /// Runs the graph to END. The input messages are appended to the restored
    /// state before the first superstep; a checkpoint is written after every
    /// node so a crashed or cancelled run resumes at the last completed step.
    /// Cancellation aborts the in-flight node call, not just the next step.
    pub async fn run(
        &self,
        input: Vec<Message>,
        ctx: &C,
        exec: &ExecutionConfig,
    ) -> EngineResult<ExecutionState> {
        let (mut state, mut parent_id) = self.restore(exec)?;
        let mut baseline = state.channel_versions();
        state.append_messages(input);

        let mut current = self.next_node(START, &state, ctx)?;
        let mut superstep = 0usize;

        while current != END {
            if exec.cancel.is_cancelled() {
                return Err(EngineError::Aborted {
                    reason: exec.cancel.abort_reason(),
                });
            }
            if superstep >= exec.run.max_supersteps {
                tracing::error!(superstep, "superstep limit exceeded");
                return Err(EngineError::SuperstepLimitExceeded);
            }

            let handler = self
                .nodes
                .get(&current)
                .ok_or_else(|| EngineError::NodeNotFound(current.clone()))?;
            tracing::debug!(node = %current, superstep, "entering node");
            // The node future races the token: a cancellation landing mid-node
            // drops the in-flight call and the superstep is never checkpointed.
            state = tokio::select! {
                result = handler(state, ctx) => result?,
                () = exec.cancel.cancelled() => {
                    tracing::info!(node = %current, "node aborted by cancellation");
                    return Err(EngineError::Aborted {
                        reason: exec.cancel.abort_reason(),
                    });
                }
            };

            if let Some(id) = self.write_checkpoint(
                exec, &state, &baseline, parent_id.as_deref(), superstep, &current,
            )? {
                parent_id = Some(id);
            }
            baseline = state.channel_versions();

            current = self.next_node(&current, &state, ctx)?;
            superstep += 1;
        }

        Ok(state)
    }
}
