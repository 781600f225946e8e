//! Run orchestration: status lifecycle, streaming, and cancellation polling.

use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::serde::TaggedValue;
use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::engine::cancel::CancellationToken;
use crate::engine::constants::CANCELLATION_POLL_INTERVAL;
use crate::engine::error::EngineResult;
use crate::engine::executor::{state_from_tuple, CompiledGraph, ExecutionConfig};
use crate::engine::message::Message;
use crate::engine::nodes::RunContext;
use crate::engine::state::{channels, ExecutionState};
use crate::engine::status::{RunStatus, RunStatusStore, StatusRecord};
use crate::engine::stream::{ChunkLog, StreamBuffer};

/// What a finished run produced. A cancelled run carries no final state; its
/// partial progress lives in the checkpoint lineage and the chunk log.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub state: Option<ExecutionState>,
    pub flushed_events: usize,
}

/// Drives one graph per run: marks the status record, streams events through
/// a batching buffer, and polls for external cancellation while executing.
pub struct Runner {
    graph: CompiledGraph<RunContext>,
    status: Arc<dyn RunStatusStore>,
    chunk_log: Arc<dyn ChunkLog>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
}

impl Runner {
    pub fn new(
        graph: CompiledGraph<RunContext>,
        status: Arc<dyn RunStatusStore>,
        chunk_log: Arc<dyn ChunkLog>,
    ) -> Self {
        Self {
            graph,
            status,
            chunk_log,
            checkpointer: None,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Background task that trips the token once the status record is
    /// externally set to cancelled.
    fn spawn_cancellation_poll(
        &self,
        run_id: String,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let status = self.status.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCELLATION_POLL_INTERVAL).await;
                match status.get(&run_id) {
                    Ok(Some(record)) if record.status == RunStatus::Cancelled => {
                        tracing::info!(run_id = %run_id, "cancellation requested");
                        cancel.cancel("run cancelled");
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(run_id = %run_id, error = %err, "status poll failed");
                    }
                }
            }
        })
    }

    /// A failed planner run must not resume into a half-executed plan, so the
    /// plan channels are reset with one extra checkpoint before the error
    /// propagates.
    fn reset_plan_channels(&self, exec: &ExecutionConfig) -> EngineResult<()> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let Some(tuple) = checkpointer.get_tuple(&exec.checkpoint_config())? else {
            return Ok(());
        };
        let mut state = state_from_tuple(&tuple)?;
        if state.plan().is_empty() && state.past_steps().is_empty() {
            return Ok(());
        }
        state.set_plan(Vec::new());
        state.set_past_steps(Vec::new());

        let mut new_values = HashMap::new();
        for channel in [channels::PLAN, channels::PAST_STEPS] {
            new_values.insert(
                channel.to_string(),
                TaggedValue::json(state.channel_value(channel)?),
            );
        }
        let checkpoint = Checkpoint::new(
            state.channel_versions(),
            serde_json::json!({"source": "error_reset"}),
        )
        .with_parent(&tuple.checkpoint.id);
        checkpointer.put(&exec.checkpoint_config(), checkpoint, new_values)?;
        Ok(())
    }

    /// Executes one run to a terminal status.
    pub async fn execute(
        &self,
        run_id: &str,
        input: Vec<Message>,
        mut ctx: RunContext,
    ) -> EngineResult<RunOutcome> {
        self.status
            .set(run_id, StatusRecord::new(RunStatus::Streaming))?;

        let cancel = CancellationToken::new();
        let poll = self.spawn_cancellation_poll(run_id.to_string(), cancel.clone());

        let buffer = Arc::new(StreamBuffer::spawn(run_id.to_string(), self.chunk_log.clone()));
        ctx.sink = buffer.clone();

        let mut exec = ExecutionConfig::new(ctx.config.clone()).with_cancel(cancel);
        if let Some(checkpointer) = &self.checkpointer {
            exec = exec.with_checkpointer(checkpointer.clone());
        }

        let result = self.graph.run(input, &ctx, &exec).await;
        poll.abort();

        // Final flush happens on every path, cancelled and failed included.
        let flushed_events = buffer.finish().await?;

        match result {
            Ok(state) => {
                self.status.set(run_id, StatusRecord::new(RunStatus::Done))?;
                Ok(RunOutcome {
                    status: RunStatus::Done,
                    state: Some(state),
                    flushed_events,
                })
            }
            Err(err) if err.is_cancellation() => {
                self.status
                    .set(run_id, StatusRecord::new(RunStatus::Cancelled))?;
                Ok(RunOutcome {
                    status: RunStatus::Cancelled,
                    state: None,
                    flushed_events,
                })
            }
            Err(err) => {
                if let Err(reset_err) = self.reset_plan_channels(&exec) {
                    tracing::warn!(error = %reset_err, "failed to reset plan channels after error");
                }
                self.status.set(run_id, StatusRecord::error(err.to_string()))?;
                Err(err)
            }
        }
    }
}
