//! Per-run configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::constants::{MAX_SUPERSTEPS, RETRIEVAL_TIMEOUT};

/// Configuration a caller supplies when starting a run. Immutable for the
/// duration of the run; all mutable data lives in the execution state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Groups all checkpoints of one conversation lineage.
    pub thread_id: String,
    /// Partition of the checkpoint store; independent graph instances
    /// sharing one physical store never see each other's checkpoints.
    pub namespace: String,
    /// Opt into the deliberate plan/execute/replan loop.
    pub planner_mode: bool,
    /// Search the web during the retrieve phase.
    pub web_search: bool,
    /// Search project documents during the retrieve phase.
    pub project_retrieval: bool,
    /// Upper bound on each retrieval query or grading call.
    pub retrieval_timeout: Duration,
    /// Upper bound on supersteps per run.
    pub max_supersteps: usize,
}

impl RunConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: "default".to_string(),
            planner_mode: false,
            web_search: false,
            project_retrieval: false,
            retrieval_timeout: RETRIEVAL_TIMEOUT,
            max_supersteps: MAX_SUPERSTEPS,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_planner_mode(mut self, enabled: bool) -> Self {
        self.planner_mode = enabled;
        self
    }

    pub fn with_web_search(mut self, enabled: bool) -> Self {
        self.web_search = enabled;
        self
    }

    pub fn with_project_retrieval(mut self, enabled: bool) -> Self {
        self.project_retrieval = enabled;
        self
    }

    pub fn with_retrieval_timeout(mut self, timeout: Duration) -> Self {
        self.retrieval_timeout = timeout;
        self
    }

    pub fn with_max_supersteps(mut self, max: usize) -> Self {
        self.max_supersteps = max;
        self
    }

    /// Whether the run enters the retrieve node at all.
    pub fn wants_retrieval(&self) -> bool {
        self.web_search || self.project_retrieval
    }
}
