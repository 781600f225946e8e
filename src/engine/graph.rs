//! Graph construction: nodes, edges, and compile-time validation.
//!
//! A [`StateGraph`] is an immutable transition table once compiled. Node
//! handlers receive the whole execution state and return a replacement; the
//! executor owns stepping, checkpointing, and termination.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::engine::constants::{END, START};
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::executor::CompiledGraph;
use crate::engine::state::ExecutionState;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A node handler: consumes the state, returns the updated state.
pub type NodeFn<C> = Arc<
    dyn for<'a> Fn(ExecutionState, &'a C) -> BoxFuture<'a, EngineResult<ExecutionState>>
        + Send
        + Sync,
>;

/// A routing function for conditional edges. Returns a route key looked up
/// in the edge's target map.
pub type RouterFn<C> = Arc<dyn Fn(&ExecutionState, &C) -> String + Send + Sync>;

pub(crate) struct ConditionalEdge<C> {
    pub(crate) router: RouterFn<C>,
    pub(crate) targets: HashMap<String, String>,
}

/// Builder for the transition table.
pub struct StateGraph<C> {
    nodes: HashMap<String, NodeFn<C>>,
    edges: HashMap<String, String>,
    conditional: HashMap<String, ConditionalEdge<C>>,
}

impl<C> Default for StateGraph<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> StateGraph<C> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            conditional: HashMap::new(),
        }
    }

    pub fn add_node<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(ExecutionState, &'a C) -> BoxFuture<'a, EngineResult<ExecutionState>>
            + Send
            + Sync
            + 'static,
    {
        self.nodes.insert(name.into(), Arc::new(handler));
        self
    }

    /// Unconditional transition. `START` as source sets the entry point.
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.insert(from.into(), to.into());
        self
    }

    /// Routed transition: the router's key selects the target from the map.
    pub fn add_conditional_edges<F>(
        mut self,
        from: impl Into<String>,
        router: F,
        targets: HashMap<String, String>,
    ) -> Self
    where
        F: Fn(&ExecutionState, &C) -> String + Send + Sync + 'static,
    {
        self.conditional.insert(
            from.into(),
            ConditionalEdge {
                router: Arc::new(router),
                targets,
            },
        );
        self
    }

    fn validate_target(&self, from: &str, to: &str) -> EngineResult<()> {
        if to == END {
            return Ok(());
        }
        if to == START {
            return Err(EngineError::Config(format!(
                "edge from {:?} may not target the start sentinel",
                from
            )));
        }
        if !self.nodes.contains_key(to) {
            return Err(EngineError::Config(format!(
                "edge from {:?} targets unknown node {:?}",
                from, to
            )));
        }
        Ok(())
    }

    /// Validates the table and freezes it for execution. Every node needs
    /// exactly one outgoing transition, every target must exist, and the
    /// entry point must be set.
    pub fn compile(self) -> EngineResult<CompiledGraph<C>> {
        if self.nodes.contains_key(START) || self.nodes.contains_key(END) {
            return Err(EngineError::Config(
                "node names may not shadow the start/end sentinels".to_string(),
            ));
        }
        if !self.edges.contains_key(START) && !self.conditional.contains_key(START) {
            return Err(EngineError::Config("graph has no entry point".to_string()));
        }

        for (from, to) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(EngineError::Config(format!(
                    "edge leaves unknown node {:?}",
                    from
                )));
            }
            self.validate_target(from, to)?;
        }
        for (from, edge) in &self.conditional {
            if from != START && !self.nodes.contains_key(from) {
                return Err(EngineError::Config(format!(
                    "conditional edge leaves unknown node {:?}",
                    from
                )));
            }
            for to in edge.targets.values() {
                self.validate_target(from, to)?;
            }
        }

        for name in self.nodes.keys() {
            let direct = self.edges.contains_key(name);
            let conditional = self.conditional.contains_key(name);
            if direct && conditional {
                return Err(EngineError::Config(format!(
                    "node {:?} has both a direct and a conditional edge",
                    name
                )));
            }
            if !direct && !conditional {
                return Err(EngineError::Config(format!(
                    "node {:?} has no outgoing edge",
                    name
                )));
            }
        }

        Ok(CompiledGraph::new(self.nodes, self.edges, self.conditional))
    }
}
