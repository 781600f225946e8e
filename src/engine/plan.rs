//! Plan model: steps, single/parallel items, and the completed-step record.

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::message::Message;

/// Bounds enforced at construction time.
pub const MAX_PLAN_ITEMS: usize = 9;
pub const MIN_PARALLEL_STEPS: usize = 2;
pub const MAX_PARALLEL_STEPS: usize = 5;

/// One unit of work. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step: String,
    pub context: String,
}

impl PlanStep {
    pub fn new(step: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            context: context.into(),
        }
    }
}

/// A plan entry: either one step or a group executed concurrently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PlanItem {
    Single(PlanStep),
    Parallel(Vec<PlanStep>),
}

/// An ordered sequence of 1..=9 plan items, consumed strictly from the front.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    items: Vec<PlanItem>,
}

impl Plan {
    /// Validates item count and parallel group sizes; rejects otherwise.
    pub fn new(items: Vec<PlanItem>) -> EngineResult<Self> {
        if items.is_empty() || items.len() > MAX_PLAN_ITEMS {
            return Err(EngineError::Config(format!(
                "plan must contain 1..={} items, got {}",
                MAX_PLAN_ITEMS,
                items.len()
            )));
        }
        for (idx, item) in items.iter().enumerate() {
            if let PlanItem::Parallel(steps) = item {
                if steps.len() < MIN_PARALLEL_STEPS || steps.len() > MAX_PARALLEL_STEPS {
                    return Err(EngineError::Config(format!(
                        "parallel group at index {} must contain {}..={} steps, got {}",
                        idx,
                        MIN_PARALLEL_STEPS,
                        MAX_PARALLEL_STEPS,
                        steps.len()
                    )));
                }
            }
        }
        Ok(Self { items })
    }

    /// First item without consuming it.
    pub fn head(&self) -> Option<&PlanItem> {
        self.items.first()
    }

    /// Pops the head, returning it with the remaining items. The remainder is
    /// raw items because an emptied plan is a legal intermediate state.
    pub fn pop(mut self) -> Option<(PlanItem, Vec<PlanItem>)> {
        if self.items.is_empty() {
            return None;
        }
        let head = self.items.remove(0);
        Some((head, self.items))
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// What was executed and the agent message that resulted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step: PlanStep,
    pub message: Message,
}

impl CompletedStep {
    pub fn new(step: PlanStep, message: Message) -> Self {
        Self { step, message }
    }
}

/// Record of one consumed plan item. A parallel group completes as one
/// `Group` entry preserving the original step order; the explicit tag keeps
/// the two shapes distinguishable without inspecting for nested lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CompletedItem {
    Single(CompletedStep),
    Group(Vec<CompletedStep>),
}

impl CompletedItem {
    /// Flattened view over the contained steps, group or not.
    pub fn steps(&self) -> Vec<&CompletedStep> {
        match self {
            CompletedItem::Single(step) => vec![step],
            CompletedItem::Group(steps) => steps.iter().collect(),
        }
    }
}
