//! Execution state: the versioned channel container threaded through nodes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::message::Message;
use crate::engine::plan::{CompletedItem, PlanItem};
use crate::engine::retrieval::RetrievedDocument;

/// Channel names as stored in checkpoints.
pub mod channels {
    pub const MESSAGES: &str = "messages";
    pub const DOCUMENTS: &str = "documents";
    pub const PLAN: &str = "plan";
    pub const PAST_STEPS: &str = "past_steps";

    pub const ALL: [&str; 4] = [MESSAGES, DOCUMENTS, PLAN, PAST_STEPS];
}

/// The engine's working memory. Each channel is independently versioned so
/// the checkpoint store can persist exactly what changed in a superstep.
///
/// Reducer semantics per channel:
/// - `messages`: append-only (explicit reset only)
/// - `documents`, `plan`, `past_steps`: last-writer-wins
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    messages: Vec<Message>,
    documents: Vec<RetrievedDocument>,
    plan: Vec<PlanItem>,
    past_steps: Vec<CompletedItem>,
    versions: HashMap<String, u64>,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        let mut state = Self::new();
        state.append_messages(messages);
        state
    }

    fn bump(&mut self, channel: &str) {
        let version = self.versions.entry(channel.to_string()).or_insert(0);
        *version += 1;
    }

    // --- messages: append-only -------------------------------------------

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
        self.bump(channels::MESSAGES);
    }

    pub fn append_messages(&mut self, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        self.messages.extend(messages);
        self.bump(channels::MESSAGES);
    }

    /// Explicit reset. The only way a messages value may shrink.
    pub fn reset_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.bump(channels::MESSAGES);
    }

    // --- documents: last-writer-wins -------------------------------------

    pub fn documents(&self) -> &[RetrievedDocument] {
        &self.documents
    }

    pub fn set_documents(&mut self, documents: Vec<RetrievedDocument>) {
        self.documents = documents;
        self.bump(channels::DOCUMENTS);
    }

    // --- plan: last-writer-wins ------------------------------------------

    pub fn plan(&self) -> &[PlanItem] {
        &self.plan
    }

    pub fn set_plan(&mut self, plan: Vec<PlanItem>) {
        self.plan = plan;
        self.bump(channels::PLAN);
    }

    // --- past steps: appended by the executor, then reassigned ------------

    pub fn past_steps(&self) -> &[CompletedItem] {
        &self.past_steps
    }

    pub fn push_past_step(&mut self, item: CompletedItem) {
        self.past_steps.push(item);
        self.bump(channels::PAST_STEPS);
    }

    pub fn set_past_steps(&mut self, past_steps: Vec<CompletedItem>) {
        self.past_steps = past_steps;
        self.bump(channels::PAST_STEPS);
    }

    // --- versioning and checkpoint plumbing -------------------------------

    pub fn channel_versions(&self) -> HashMap<String, u64> {
        self.versions.clone()
    }

    /// Channels whose version advanced past the given baseline.
    pub fn changed_since(&self, baseline: &HashMap<String, u64>) -> Vec<String> {
        let mut changed: Vec<String> = self
            .versions
            .iter()
            .filter(|(channel, version)| baseline.get(*channel).map_or(true, |b| *version > b))
            .map(|(channel, _)| channel.clone())
            .collect();
        changed.sort();
        changed
    }

    /// Serialized snapshot of one channel's current value.
    pub fn channel_value(&self, channel: &str) -> EngineResult<serde_json::Value> {
        match channel {
            channels::MESSAGES => Ok(serde_json::to_value(&self.messages)?),
            channels::DOCUMENTS => Ok(serde_json::to_value(&self.documents)?),
            channels::PLAN => Ok(serde_json::to_value(&self.plan)?),
            channels::PAST_STEPS => Ok(serde_json::to_value(&self.past_steps)?),
            other => Err(EngineError::Config(format!("unknown channel: {}", other))),
        }
    }

    /// Restores one channel from a stored snapshot without bumping versions;
    /// used when reconstructing state from a checkpoint.
    pub fn restore_channel(
        &mut self,
        channel: &str,
        value: serde_json::Value,
        version: u64,
    ) -> EngineResult<()> {
        match channel {
            channels::MESSAGES => self.messages = serde_json::from_value(value)?,
            channels::DOCUMENTS => self.documents = serde_json::from_value(value)?,
            channels::PLAN => self.plan = serde_json::from_value(value)?,
            channels::PAST_STEPS => self.past_steps = serde_json::from_value(value)?,
            other => return Err(EngineError::Config(format!("unknown channel: {}", other))),
        }
        self.versions.insert(channel.to_string(), version);
        Ok(())
    }
}
